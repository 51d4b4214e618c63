// Copyright 2025 tagrpc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # tagrpc CLI
//!
//! Command-line interface for tagrpc.
//!
//! - **Serving**: `tagrpc serve` exposes a small built-in provider
//! - **Calling**: `tagrpc call` makes one call and prints the result as JSON
//!
//! ## Architecture
//!
//! The binary parses arguments with `argh`, loads an optional JSON config
//! file and hands off to `tagrpc-server` or `tagrpc-client`. This library
//! holds the pieces the binary shares with its tests.

pub mod builtin;
pub mod config;
pub mod json;


pub use builtin::builtin_methods;
pub use config::{CliConfig, BIND_ENV};
pub use json::{json_to_value, parse_args, value_to_json};
