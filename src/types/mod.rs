/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for basic types used across PBFT-rs.

pub mod basic;

pub mod keypair;

pub mod replica_set;
