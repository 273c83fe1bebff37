pub mod app;
pub mod commands;
pub mod dispatch;
pub mod env;
pub mod inject;
pub mod inspect;
pub mod output;
