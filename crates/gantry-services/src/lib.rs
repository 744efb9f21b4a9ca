//! gantry-services — the moving parts of the coordinator.
//!
//! Fetchers resolve module bytes by CID, the contract port feeds tasks in and
//! results out, the cluster driver turns a task into a one-shot Job, the
//! precompile verifier replays the on-chain snapshot check in-process, and
//! the coordinator loop ties them together one task at a time.

pub mod cluster;
pub mod contract;
pub mod coordinator;
pub mod fetch;
pub mod kube;
pub mod precompile;

pub use cluster::{ClusterDriver, ClusterError, CreatedJob};
pub use contract::{ContractClient, ContractError, PlaceholderContract};
pub use coordinator::{Coordinator, RunError};
pub use fetch::{FetchError, GatewayFetcher, MirrorFetcher, ModuleFetcher};
pub use self::kube::KubeDriver;
pub use precompile::{verify_snapshot, MerkleProof, PrecompileError};
