#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

extern crate walkdir;

#[macro_use]
extern crate log;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
    }
    errors {
        DuplicateIdentity(id: String, first: String, second: String) {
            description("duplicate object identity")
            display("object {} defined both by {} and {}", id, first, second)
        }
        MalformedObject(origin: String, reason: String) {
            description("object does not parse into canonical form")
            display("malformed object from {}: {}", origin, reason)
        }
    }
}

/// Ordered tree representation of arbitrary kubernetes specs
pub mod node;
pub use node::{Node, Scalar, Step};

/// Canonical object model
pub mod object;
pub use object::{CanonicalObject, Identity, Origin};

/// Kind knowledge tables (deploy order, references, defaults, immutability)
pub mod kinds;

/// Document and folder ingestion
pub mod loader;
pub use loader::ObjectSet;
