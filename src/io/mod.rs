// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! I/O providers for running [`Server`s](crate::server::Server).
//!
//! A [`Server`](crate::server::Server) turns parsed requests into
//! responses and knows nothing of sockets. The providers here bind the
//! listening sockets, read request heads off accepted connections, hand
//! them to the [`Server`](crate::server::Server) and write the
//! responses back.

mod blocking;
mod socket;

pub use blocking::{BlockingIoConfig, BlockingIoProvider};
