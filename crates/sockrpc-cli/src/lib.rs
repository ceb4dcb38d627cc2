// Copyright 2025 sockrpc Authors
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

//! # sockrpc CLI
//!
//! Command-line front end for sockrpc.
//!
//! ## Key Commands
//!
//! - `sockrpc serve`: Run a server with the bundled echo service
//! - `sockrpc call`: Make one RPC call (outputs raw JSON for scripting)
//! - `sockrpc ping`: Time repeated echo calls and report mean latency
//!
//! The library part only holds what the binary needs outside `main`: the
//! latency bookkeeping behind `ping`.

pub mod stats;
