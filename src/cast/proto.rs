//! Generated protobuf types for the Cast v2 wire protocol and device-auth
//! handshake, compiled from `proto/cast_channel.proto` by `build.rs`.

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/castforge.proto.rs"));
