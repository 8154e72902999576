//! Root crate: exists only to host the end-to-end scenario suite under
//! `tests/`, in the teacher's mixed-manifest style (the root package is
//! both a workspace member and a plain library, per the root
//! `Cargo.toml`'s `[[test]]` entries). Carries no runtime code of its own.
