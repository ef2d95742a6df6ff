//! Pulso - timing reconciliation core for mobile performance monitoring
//!
//! This library correlates timing data produced by two independent
//! execution contexts, a single-threaded application runtime and a
//! native platform layer, that communicate only through an asynchronous
//! message-passing bridge with no shared clock and no delivery-order
//! guarantee. It measures app-start latency, UI frame health
//! (slow/frozen frames) and screen-render latency (time to
//! initial/full display), splicing the results into transaction events
//! before they reach the outbound transport.

pub mod app_start;
pub mod bridge;
pub mod config;
pub mod display;
pub mod event;
pub mod expiring;
pub mod frames;
pub mod ids;
pub mod next_frame;
pub mod processor;
pub mod time;
