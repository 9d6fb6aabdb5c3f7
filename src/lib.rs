pub mod app;
pub mod audio;
pub mod config;
pub mod control;
pub mod effects;
pub mod engine;
pub mod frame;
pub mod pipeline;
pub mod registry;
pub mod render;
pub mod segmentation;
pub mod terminal;
