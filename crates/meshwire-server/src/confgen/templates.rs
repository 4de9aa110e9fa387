//! Template substitution helpers.
//!
//! Two placeholder families:
//!
//! * Address templates from the network config use `{node}` / `{peer}`
//!   (decimal) for IPv4 and link-local, `{node:x}` / `{peer:x}`
//!   (lowercase hex) for IPv6. The forms are not interchangeable.
//! * Config-file templates use `{{ .FieldName }}` markers replaced by a
//!   fixed, documented set of bindings. This is literal substitution,
//!   not a template language; unknown markers pass through untouched so
//!   a typo is visible in the rendered output.

/// Substitute `{node}` / `{peer}` with decimal identifiers.
pub fn render_addr_v4(template: &str, node: i64, peer: i64) -> String {
    template
        .replace("{node}", &node.to_string())
        .replace("{peer}", &peer.to_string())
}

/// Substitute `{node:x}` / `{peer:x}` with lowercase hex identifiers.
pub fn render_addr_v6(template: &str, node: i64, peer: i64) -> String {
    template
        .replace("{node:x}", &format!("{node:x}"))
        .replace("{peer:x}", &format!("{peer:x}"))
}

/// Replace each `{{ .Name }}` marker with its binding.
pub fn render_placeholders(template: &str, bindings: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in bindings {
        out = out.replace(&format!("{{{{ .{name} }}}}"), value);
    }
    out
}

/// Format a peer endpoint: IPv6 literals are bracketed.
pub fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
