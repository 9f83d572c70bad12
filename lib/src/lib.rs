// Copyright 2024 The Revfs Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Library for Revfs - a versioned filesystem storage engine.
//!
//! The engine stores a sequence of committed revisions, each an immutable
//! tree of directories, files, and properties. Storage is shared across
//! revisions through skip-delta chains and content-addressed representation
//! sharing. Commits are staged in per-transaction mutable areas and become
//! revisions through a single atomic pointer bump.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod base36;
pub mod changes;
pub mod commit;
pub mod config;
pub mod file_util;
pub mod history;
pub mod hotcopy;
pub mod id;
pub mod lock;
pub mod locks;
pub mod node_rev;
pub mod pack;
pub mod proplist;
pub mod rep_cache;
pub mod representation;
pub mod revision;
pub mod store;
pub mod svndiff;
pub mod transaction;
pub mod upgrade;
