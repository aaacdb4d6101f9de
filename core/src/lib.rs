#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod inject;
pub mod select;
pub mod validate;

pub use self::inject::{Directives, Injector};
