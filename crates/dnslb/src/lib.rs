//! Server-side DNS load balancing for a cluster of service instances.
//!
//! Each instance adds its own IP to the A record-set of a shared FQDN,
//! probes the health of its peers over TCP (optionally TLS), and removes
//! peers that keep failing. Clients use round-robin DNS to pick a server
//! and fail over while an unhealthy one is being drained out of the set.
//!
//! A highly available cluster comes out of this without an external load
//! balancer: the only dependency is the DNS system, which is an essential
//! service anyway, and no separate record management is needed because
//! the servers self-register. During a network partition peers may flap
//! in and out of the record-set until connectivity is restored; region
//! filtering keeps a partitioned controller from destroying instances it
//! cannot reach but that are healthy elsewhere.
//!
//! Beyond the steady-state controller ([`LoadBalancer`]) the crate
//! provides two operator actions coordinated through a `_blocked` TXT
//! record next to the load-balanced name: [`block`] vetoes one IP's
//! self-registration for a while, and [`rolling_replace`] drains and
//! destroys each regional instance in turn, waiting for its replacement
//! to register before moving on.

mod block;
mod blocked;
mod controller;
mod error;
mod hcloud;
mod instances;
mod probe;
mod rolling;

pub use block::block;
pub use blocked::BlockedRecord;
pub use controller::{detect_my_ip, LbParams, LoadBalancer};
pub use error::LbError;
pub use hcloud::HcloudProvider;
pub use instances::{ComputeProvider, Destroyer, InstanceHandler, IpSet, NullHandler, RegionFilter};
pub use rolling::rolling_replace;
