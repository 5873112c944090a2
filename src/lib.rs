// Copyright 2026 Colloquy Authors
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

//! Embedded conversation store for a desktop AI-chat application:
//! append-heavy message writes, keyset-paginated history reads,
//! trigger-maintained full-text search, a tool-execution ledger, and a
//! one-time import of the legacy flat-file format.
//!
//! [`engine::Engine`] owns the single SQLite handle; the other modules
//! are thin operation sets over it. Store calls are synchronous and
//! bounded; callers wrap them in their own async primitive. Read
//! operations absorb faults (logged, empty result) so a failed history
//! read degrades the view instead of crashing it; write operations
//! report failure to their immediate caller.

pub mod config;
pub mod conversation;
pub mod engine;
pub mod import;
pub mod ledger;
pub mod message;
pub mod migrate;
pub mod model;
pub mod search;

pub use config::Config;
pub use engine::Engine;
pub use engine::StoreHealth;
pub use engine::shared;
