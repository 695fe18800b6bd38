// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Errors, using [`failure`][failure].
//!
//! [failure]: https://crates.io/crates/failure

use failure::{Error, Fail};

/// Result alias used throughout the crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Enum to hold the errors that can occur within firewhale.
#[derive(Debug, Fail)]
pub enum FirewhaleError {
    /// The nftables engine rejected a batch.
    #[fail(display = "nft returned an error: '{}'", stderr)]
    NftablesError {
        /// Whatever nft printed to stdout before failing.
        stdout: String,
        /// The error text reported by nft.
        stderr: String,
    },

    /// The bridged transport has no agent attached (or lost it mid-call).
    #[fail(display = "firewall agent is not connected")]
    AgentNotConnected,

    /// A labelled rule string could not be compiled.
    #[fail(display = "invalid rule '{}': {}", rule, reason)]
    InvalidRule {
        /// The offending rule string, verbatim from the label.
        rule: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A container cannot be projected at all.
    #[fail(display = "container configuration error: {}", reason)]
    ContainerConfiguration {
        /// Why the container was rejected.
        reason: String,
    },

    /// A chain we rely on but do not own is missing.
    #[fail(display = "chain '{}' not found in table '{}'", chain, table)]
    ChainNotFound {
        /// Name of the missing chain.
        chain: String,
        /// Table that was searched.
        table: String,
    },
}
