//! Fault injection points for tests, compiled in with the `failpoints` feature.
//!
//! A failpoint configured with `return(<kind>)` fails with the matching [`ErrorKind`]; a bare
//! `return` fails with the kind natural to the stage it guards.

use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};

/// Before a finished `.partial` file is renamed to its final name.
pub const SERIALIZE_BEFORE_PROMOTE: &str = "serialize.before_promote";

/// Before a staged file is uploaded with `PUT`.
pub const UPLOAD_BEFORE_PUT: &str = "upload.before_put";

/// Before the bulk load is issued.
pub const LOAD_BEFORE_COPY: &str = "load.before_copy";

pub fn etl_fail_point(name: &str, default_kind: ErrorKind) -> EtlResult<()> {
    fail_point!(name, |parameter| {
        let kind = match parameter.as_deref() {
            Some("serialize") => ErrorKind::SerializeFailed,
            Some("upload") => ErrorKind::UploadFailed,
            Some("load") => ErrorKind::LoadFailed,
            Some("unavailable") => ErrorKind::SourceUnavailable,
            _ => default_kind,
        };

        bail!(
            kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
