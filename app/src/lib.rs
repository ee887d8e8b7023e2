pub mod app;
pub mod ui;

pub use app::{parse_input, send_options, Input, NewsdeskApp};
pub use ui::Transcript;
