pub mod dashboard;
pub mod price;
pub mod trading;

pub use dashboard::*;
pub use price::*;
pub use trading::*;
