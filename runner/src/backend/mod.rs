/*
 * Copyright 2025 Oxide Computer Company
 */

mod batch;
mod fargate;

pub use batch::BatchEngine;
pub use fargate::FargateEngine;

/**
 * Remote job names come from user-supplied configuration; both backends
 * restrict names to a conservative character set and length.
 */
fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(128);

    if out.is_empty() {
        out.push_str("gantry");
    }

    out
}
