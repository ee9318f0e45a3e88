//! The launch/delete worker: drives the compute and load-balancer APIs
//! with polling state machines, compensating undo, and verified
//! deletion, then settles results back into group state through
//! `modify_state`.

pub mod catalog;
pub mod delete;
pub mod http;
pub mod launch;
pub mod supervisor;
pub mod traits;
pub mod undo;

pub use catalog::{public_endpoint_url, CatalogEndpoint, CatalogService};
pub use http::{HttpComputeClient, HttpLoadBalancerClient};
pub use launch::{launch_server, prepare_launch_config, wait_for_active, LaunchedServer};
pub use supervisor::{PollSettings, Supervisor};
pub use traits::{Address, ComputeClient, LoadBalancerClient, ServerDetails};
pub use undo::UndoStack;
