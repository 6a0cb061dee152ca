// Copyright 2025 jsvault Authors
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


//! # jsvault CLI
//!
//! Command-line interface for the jsvault script host.
//!
//! - `jsvault serve`: load a script tree and start the HTTP/WebSocket server
//! - `jsvault tasks`: print the task registry diagnostics of a running server
//! - `jsvault stop-task`: force-stop one task on a running server
//!
//! The admin commands talk to the server's `/__tasks` endpoints through
//! [`admin::AdminClient`].

pub mod admin;
