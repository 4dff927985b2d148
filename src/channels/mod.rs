//! Inbound channels. HTTP is the only one.

pub mod web;
