//! modelgrid-deploy — deploying artifacts onto worker nodes.
//!
//! # Architecture
//!
//! ```text
//! deploy(artifact, targets?)
//!   └── DeploymentCoordinator
//!       ├── EligibilityResolver → worker set
//!       ├── TaskRegistry.create_task, artifact → DEPLOYING
//!       └── fan-out DeployCommand ──► NodeService (each worker)
//!                                       └── WorkerDeploymentExecutor
//!                                           ├── bounded pool, fail-fast admission
//!                                           ├── InferenceEngine.materialize (timeout)
//!                                           └── one DeployDone ──► coordinator
//! ```
//!
//! Every task and artifact write goes through the [`TaskRegistry`], which
//! serializes mutations per record with a bounded wait.

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod executor;
pub mod node;
pub mod registry;

pub use coordinator::{DeployAck, DeploymentCoordinator};
pub use engine::{EngineResult, FsEngine, InferenceEngine};
pub use error::{DeployError, DeployResult, EngineError, ErrorCategory};
pub use executor::WorkerDeploymentExecutor;
pub use node::NodeService;
pub use registry::{RecordPermit, TaskRegistry};
