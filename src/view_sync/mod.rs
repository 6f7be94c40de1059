/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The simplified view advance subprotocol: a progress timer and SET-VIEW announcements that
//! rotate the cluster away from a crashed or equivocating primary.

pub mod messages;

pub(crate) mod protocol;
