//! Network awareness.
//!
//! A [`ConnectivityProbe`] answers "are we online right now?" and a
//! [`NetworkMonitor`] turns connectivity transitions into calls on a
//! [`ConnectivityListener`] (the download manager).

mod monitor;
mod probe;

pub use monitor::{ConnectivityListener, NetworkMonitor};
pub use probe::{ConnectivityProbe, HttpConnectivityProbe, ManualConnectivity};
