//! Orchestration of a two-stage image simulation pipeline on batch clusters.
//!
//! Stage 1 preprocesses a visit, stage 2 raytraces every sensor exposure of
//! that visit. This crate derives stable identities for both kinds of work
//! unit, plans where each unit reads and writes, renders scheduler specific
//! job scripts and gates stage 2 on the verified outputs of stage 1.

pub mod collector;
pub mod config;
pub mod coordinator;
pub mod executors;
pub mod identity;
pub mod layout;
pub mod manifest;
pub mod planner;
pub mod script;
pub mod tracker;
pub mod verify;
