// Tests module
// Multi-node scenarios: fork choice, orphan pruning, engine flows,
// persistence, the node service and pool properties

pub mod common;
pub mod orphan_pruning;
pub mod dpos_flow;
pub mod persistence;
pub mod pool_properties;
