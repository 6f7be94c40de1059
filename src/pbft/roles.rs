/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that determine what role a replica plays in a given view.

use crate::types::{
    basic::{ReplicaId, ViewNumber},
    replica_set::ReplicaSet,
};

/// Whether `replica` is the primary of `view`, i.e., the replica expected to assign sequence
/// numbers and originate PRE-PREPAREs in that view.
pub fn is_primary(replica: &ReplicaId, view: ViewNumber, replica_set: &ReplicaSet) -> bool {
    replica_set.primary(view) == *replica
}
