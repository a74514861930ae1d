//! Request and object signing
//!
//! Two independent schemes authenticate federation traffic: HTTP signatures
//! (draft-cavage) over individual requests, and Data Integrity proofs
//! embedded in objects. Keys for both are modeled in [keys]; fetched public
//! keys are memoized in [key_cache].

/// HTTP signatures over requests
pub mod http;
/// Remote key memoization
pub mod key_cache;
/// Key material and (de)serialization
pub mod keys;
/// Data Integrity proofs (eddsa-jcs-2022)
pub mod proof;
pub(crate) mod rdf;
pub(crate) mod rsa2017;
pub(crate) mod urdna;
