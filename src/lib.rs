// Copyright 2026 the winsub authors
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
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'loader/memory.rs' owns the mmap/mprotect calls and the only derefs into
//   mapped image memory
// - 'loader/imports.rs' resolves host symbols through libloading
// - 'subset.rs' defines the C-ABI allocator hooks and invokes foreign code
// - 'image.rs' maps input files read-only

//! # winsub
//!
//! Loads the 32-bit Windows font-subsetting DLL (`fontsub.dll`) into a Linux process
//! — without any help from the host OS loader — and exposes its two exported entry
//! points, `CreateFontPackage` and `MergeFontPackage`, as directly callable
//! functions for fuzzing.
//!
//! No host service knows how to load a foreign binary format, so every step is done
//! by hand: fixed-address section mapping, import-table patching, base relocation,
//! page-protection finalization and export lookup. Around that core sit the
//! utilities one fuzzing iteration needs: the sfnt table container, the ratio-driven
//! byte mutators, and the sample-driving harness.
//!
//! ## Features
//!
//! - **Manual PE loading** - fixed-placement section mapping with fail-fast
//!   semantics; no partial images
//! - **Allocator interposition** - the image's `malloc`/`realloc`/`free` imports and
//!   the entry-point callback triple share one host allocator, so buffers can cross
//!   the boundary in both directions
//! - **Graceful import degradation** - unresolvable imports are patched with
//!   distinguishable poison markers instead of failing the load
//! - **Deterministic fuzzing** - call parameters and mutations derive from the
//!   sample bytes; a crash reproduces from the input file alone
//! - **Auditable patching** - every write into the mapped image flows through one
//!   bounds-checked accessor
//!
//! ## Quick Start
//!
//! ```ignore
//! use winsub::{harness, subset::FontSubsetter, LoadConfig, Loader};
//!
//! let dll = std::fs::read("fontsub.dll")?;
//! let font = std::fs::read("sample.ttf")?;
//!
//! let library = Loader::new(LoadConfig::new()).load(&dll)?;
//! let subsetter = unsafe { FontSubsetter::from_library(&library)? };
//! for record in unsafe { harness::process_sample(&subsetter, &font) } {
//!     println!("{}", record);
//! }
//! ```
//!
//! ## Architecture
//!
//! `winsub` is organized into several key modules:
//!
//! - [`loader`] - the load pipeline: map, patch imports, relocate, protect, locate
//!   exports
//! - [`image`] - the parsed view of an image file ([`goblin`] does the parsing)
//! - [`subset`] - the subsetter's native contract: signatures, constants, the
//!   allocator triple
//! - [`harness`] - per-sample parameter derivation and the subset/merge workflow
//! - [`sfnt`] - the tag/length/value font container
//! - [`mutate`] - the ratio-driven byte mutators
//! - [`Error`] and [`Result`] - crate-wide error handling
//!
//! ## Platform
//!
//! The loader targets Linux (`mmap`/`mprotect`/`dlsym` underneath). Loading,
//! patching and every test work on any pointer width; actually *invoking* the
//! loaded entry points requires a 32-bit x86 host process, because the image's code
//! and calling convention are 32-bit. Build the driver with
//! `--target i686-unknown-linux-gnu` for that.
//!
//! ## Fuzzing
//!
//! ```bash
//! # The in-repo target round-trips arbitrary bytes through the sfnt container
//! cargo +nightly fuzz run sfnt_mutate
//! ```

#[macro_use]
pub(crate) mod error;

pub mod harness;
pub mod image;
pub mod loader;
pub mod mutate;
pub mod sfnt;
pub mod subset;

/// `winsub` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is
/// always [`Error`]. Used consistently throughout the crate for all fallible
/// operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `winsub` Error type
///
/// The main error type for all operations in this crate; the docs on each
/// variant spell out the severity model.
pub use error::Error;

/// The load pipeline's driver and configuration.
///
/// See [`loader`] for the stage-by-stage description.
pub use loader::{LoadConfig, LoadState, LoadedLibrary, Loader};
