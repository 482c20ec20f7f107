//! NetMonitor - multi-protocol network endpoint monitoring.
//!
//! Probes endpoints over ICMP, TCP, UDP and HTTP(S) on a schedule or on
//! demand, and folds results into hourly and daily statistics.

pub mod aggregate;
pub mod config;
pub mod manual;
pub mod probe;
pub mod scheduler;
pub mod sink;
pub mod web;
