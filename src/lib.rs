//! Room Visualizer
//!
//! Core of the "visualize this furniture in your room" widget: a client-local
//! job queue that persists across reloads of one session, submits room photos
//! to the generation backend, and resumes or fails out work a reload cut off.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;
