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

//! An HTTP redirector configured entirely through DNS.
//!
//! The owner of a hostname publishes TXT records at
//! `_redirect.<hostname>` describing where requests for that hostname
//! should go (see [`rule`] for the record language). For each request,
//! the [`server::Server`] looks those records up, picks the rule that
//! applies to the request path with [`resolve::resolve`], and answers
//! with the corresponding redirect.
//!
//! For deployments that terminate TLS with automatically issued
//! certificates, [`policy::HostPolicy`] decides which hostnames may get
//! one and [`cert::RateLimitedCache`] caps how many certificates are
//! stored per registrable domain each week.

pub mod cert;
pub mod clock;
pub mod io;
pub mod lookup;
pub mod policy;
pub mod resolve;
pub mod rule;
pub mod server;
pub mod thread;
