#![allow(clippy::arithmetic_side_effects)]

#[macro_use]
extern crate log;

pub mod cluster_info;
pub mod contact_info;
pub mod crds;
pub mod crds_data;
pub mod crds_filter;
pub mod crds_value;
pub mod gossip_error;
pub mod gossip_service;
mod packet_builder;
pub mod ping_pong;
pub mod protocol;
pub mod push_active_set;
