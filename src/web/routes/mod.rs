// Route handler modules

pub mod audio;
pub mod health;
pub mod manager;
pub mod models;
pub mod system;
