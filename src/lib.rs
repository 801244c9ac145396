// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

#![doc = include_str!("../README.md")]
#![deny(
    unsafe_op_in_unsafe_fn,
    // rustdoc
    rustdoc::redundant_explicit_links,
    rustdoc::broken_intra_doc_links,
    // clippy
    // groups
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::style,
    // restriction
    clippy::as_underscore,
    clippy::dbg_macro,
    clippy::missing_safety_doc,
    clippy::undocumented_unsafe_blocks,
    // pedantic
    clippy::bool_to_int_with_if,
    clippy::borrow_as_ptr,
    clippy::cast_lossless,
    clippy::cast_ptr_alignment,
    clippy::doc_markdown,
    clippy::expect_fun_call,
    clippy::or_fun_call,
    clippy::ptr_as_ptr,
    clippy::unnecessary_fallible_conversions,
    clippy::unused_enumerate_index,
)]
#![allow(
    clippy::multiple_crate_versions,
    clippy::missing_const_for_fn,
    clippy::cognitive_complexity
)]

#[cfg(not(target_pointer_width = "64"))]
core::compile_error!("Can only be compiled on targets with 64bit address support");

pub mod aarch64;
pub mod analysis;
pub mod cache;
pub mod exec_block;
pub mod memory;
pub mod patch;
pub mod tracing;
