pub mod audit;
pub mod compare;
pub mod controller;
pub mod cursor;
pub mod gate;
pub mod mirror;
pub mod progress;
pub mod stats;
pub mod transfer;
