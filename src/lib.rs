//! Entity-resolution core for Indian medical/dental/DNB counselling data —
//! shared modules for the `collmatch` binary.

pub mod alias;
pub mod cache;
pub mod candidate_gen;
pub mod config;
pub mod course_stream;
pub mod error;
pub mod llm;
pub mod master_index;
pub mod master_store;
pub mod models;
pub mod normalize;
pub mod pincode;
pub mod pipeline;
pub mod progress;
pub mod row_id;
pub mod row_store;
pub mod scoring;
pub mod state_alias;
pub mod verifier;
