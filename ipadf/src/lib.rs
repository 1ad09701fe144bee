pub mod error;

// flat-table readers and writers
pub mod io {
    pub mod export;
    pub mod tables;
}

pub mod pipeline;
