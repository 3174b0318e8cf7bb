#![allow(dead_code)]

pub mod builders;
pub mod strategies;
pub mod tasks;

pub use builders::*;
pub use tasks::*;
