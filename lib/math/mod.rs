pub mod arbitration;
pub mod cpmm;
