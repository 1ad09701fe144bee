// Purpose: physical constants used by adduct and isotope calculations
pub const MASS_ELECTRON: f64 = 5.48579909065e-4; // Unified atomic mass unit

// conversion factor for parts-per-million tolerances
pub const PPM: f64 = 1e-6;
