pub mod logger;
pub mod startup;
