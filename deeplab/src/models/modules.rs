mod aspp;
mod simple_convs;
mod upsample;
mod utils;

pub use aspp::*;
pub use simple_convs::*;
pub use upsample::*;
pub use utils::*;
