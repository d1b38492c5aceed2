pub mod icons;
pub mod progress;
pub mod report;

pub use progress::{RunUI, UiMode, format_duration};
pub use report::render_report;
