pub mod controller;
pub mod dataset;
pub mod requests;
