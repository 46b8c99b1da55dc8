pub mod history;
pub mod setup;
pub mod show;
pub mod ui;
