//! Textual rendering of the main and http configuration files.
//!
//! Output ordering follows the BTreeMap iteration order of the model, so a
//! given model always renders to the same bytes.

use std::fmt::Write as _;

use super::conf::{Directive, HttpConfig, Location, ReturnConf, Server, CATCH_ALL};
use crate::config::NginxSettings;

/// Render nginx.conf. The http block pulls in the generated http.conf.
pub fn render_main(settings: &NginxSettings) -> String {
    let mut out = String::new();

    out.push_str("# generated by ingressd; do not edit\n");
    out.push_str("daemon off;\n");
    let _ = writeln!(out, "user {};", settings.user);
    match settings.worker_processes {
        Some(n) => {
            let _ = writeln!(out, "worker_processes {n};");
        }
        None => out.push_str("worker_processes auto;\n"),
    }
    out.push_str("pid nginx.pid;\n");
    out.push_str("error_log /dev/stderr;\n");
    out.push('\n');
    out.push_str("events {\n");
    let _ = writeln!(out, "    worker_connections {};", settings.worker_connections);
    out.push_str("}\n");
    out.push('\n');
    out.push_str("http {\n");
    out.push_str("    include http.conf;\n");
    out.push_str("}\n");

    out
}

/// Render http.conf: log settings, then every plain server, then every
/// TLS-terminating server.
pub fn render_http(conf: &HttpConfig) -> String {
    let mut out = String::new();

    out.push_str("# generated by ingressd; do not edit\n");
    let _ = writeln!(out, "log_format main {};", conf.log_format);
    let _ = writeln!(out, "access_log {} main;", conf.access_log);

    for server in conf.servers.values() {
        render_server(&mut out, server, conf, false);
    }
    for server in conf.tls_servers.values() {
        render_server(&mut out, server, conf, true);
    }

    out
}

fn render_server(out: &mut String, server: &Server, conf: &HttpConfig, tls: bool) {
    out.push('\n');
    out.push_str("server {\n");

    if tls {
        let _ = writeln!(out, "    listen {} ssl;", conf.listen_tls);
        if conf.http2 {
            out.push_str("    http2 on;\n");
        }
    } else if server.server_name == CATCH_ALL {
        let _ = writeln!(out, "    listen {} default_server;", conf.listen);
    } else {
        let _ = writeln!(out, "    listen {};", conf.listen);
    }

    let _ = writeln!(out, "    server_name {};", server.server_name);

    if let Some(paths) = &server.tls {
        let _ = writeln!(out, "    ssl_certificate {};", paths.cert);
        let _ = writeln!(out, "    ssl_certificate_key {};", paths.key);
    }

    for location in server.locations.values() {
        render_location(out, location);
    }

    out.push_str("}\n");
}

fn render_location(out: &mut String, loc: &Location) {
    let _ = writeln!(out, "    location {} {{", loc.path.key());

    if loc.disable_access_log {
        out.push_str("        access_log off;\n");
    }
    if let Some(auth) = &loc.basic_auth {
        let _ = writeln!(out, "        auth_basic \"{}\";", auth.realm);
        let _ = writeln!(out, "        auth_basic_user_file {};", auth.user_file);
    }
    if let Some(proxy) = &loc.proxy_pass {
        let _ = writeln!(out, "        proxy_pass {};", proxy.upstream);
    }
    if let Some(ret) = &loc.ret {
        render_return(out, ret);
    }
    for directive in &loc.directives {
        render_directive(out, directive);
    }

    out.push_str("    }\n");
}

// Redirects take a bare URI, everything else a quoted body.
fn render_return(out: &mut String, ret: &ReturnConf) {
    if (300..400).contains(&ret.code) {
        let _ = writeln!(out, "        return {} {};", ret.code, ret.body);
    } else {
        let _ = writeln!(out, "        return {} \"{}\";", ret.code, ret.body);
    }
}

fn render_directive(out: &mut String, directive: &Directive) {
    if directive.args.is_empty() {
        let _ = writeln!(out, "        {};", directive.name);
    } else {
        let _ = writeln!(out, "        {} {};", directive.name, directive.args);
    }
}
