#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod accumulate;
pub mod bgen;
pub mod bgi;
pub mod config;
pub mod error;
pub mod io;
pub mod kernel;
pub mod layout;
pub mod locate;
pub mod pipeline;
pub mod pool;
pub mod prepare;
pub mod reconcile;
pub mod retry;
pub mod types;
pub mod vcf;
