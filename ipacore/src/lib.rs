// chemistry module
pub mod chemistry {
    pub mod constants;
    pub mod elements;
    pub mod sum_formula;
}

// algorithm module
pub mod algorithm {
    pub mod isotope;
    pub mod similarity;
    pub mod utility;
}

// data module
pub mod data {
    pub mod feature;
    pub mod compound;
    pub mod spectrum;
    pub mod annotation;
}

// inference module, one file per pipeline phase
pub mod inference {
    pub mod clustering;
    pub mod isotope_mapping;
    pub mod adducts;
    pub mod scoring;
    pub mod relations;
    pub mod gibbs;
}

pub mod error;
pub mod progress;
