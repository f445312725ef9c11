//! A fake-compiler test double that speaks the module-mapper protocol
//! directly, without understanding C++20 module syntax itself. Exists so
//! the module-import/module-cycle scenarios can run in CI without a
//! module-aware GCC toolchain on the build machine.
//!
//! Reads `-fmodule-mapper=localhost:<port>?<ident>` off its own argv like a
//! real compiler would, then: imports every `--requires=<module>` (blocking
//! on the mapper exactly as a real compiler's frontend would while reading
//! an import), exports and "compiles" every `--provides=<module>` (writing
//! an empty placeholder CMI), and finally writes an empty object file and
//! `.d` file at the paths it was given.

use std::{
    io::{BufRead, BufReader, Write},
    net::TcpStream,
    path::Path,
};

type BoxError = Box<dyn std::error::Error>;

struct Invocation {
    port: String,
    ident: String,
    provides: Vec<String>,
    requires: Vec<String>,
    source: Option<String>,
    output: Option<String>,
    depfile: Option<String>,
}

fn parse_argv(args: &[String]) -> Result<Invocation, BoxError> {
    let mapper_arg = args
        .iter()
        .find_map(|a| a.strip_prefix("-fmodule-mapper="))
        .ok_or("missing -fmodule-mapper=... argument")?;
    let (host_port, ident) = mapper_arg.split_once('?').ok_or("mapper spec missing '?ident'")?;
    let port = host_port.rsplit_once(':').ok_or("mapper spec missing port")?.1.to_owned();

    let mut provides = Vec::new();
    let mut requires = Vec::new();
    let mut source = None;
    let mut output = None;
    let mut depfile = None;

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(module) = arg.strip_prefix("--provides=") {
            provides.push(module.to_owned());
        } else if let Some(module) = arg.strip_prefix("--requires=") {
            requires.push(module.to_owned());
        } else if arg == "-o" {
            output = iter.next().cloned();
        } else if arg == "-MF" {
            depfile = iter.next().cloned();
        } else if arg == "-c" {
            source = iter.next().cloned();
        }
    }

    Ok(Invocation {
        port,
        ident: ident.to_owned(),
        provides,
        requires,
        source,
        output,
        depfile,
    })
}

fn send(stream: &mut TcpStream, line: &str) -> std::io::Result<()> {
    writeln!(stream, "{line}")
}

fn read_reply(reader: &mut BufReader<TcpStream>) -> std::io::Result<String> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line.trim_end().to_owned())
}

fn run(invocation: &Invocation) -> Result<(), BoxError> {
    let stream = TcpStream::connect(format!("[::1]:{}", invocation.port))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    send(&mut writer, &format!("HELLO 1 fakecc {}", invocation.ident))?;
    let hello = read_reply(&mut reader)?;
    if !hello.starts_with("HELLO") {
        return Err(format!("mapper rejected HELLO: {hello}").into());
    }

    send(&mut writer, "MODULE-REPO")?;
    let repo = read_reply(&mut reader)?;
    let cmi_dir = repo.strip_prefix("PATHNAME ").ok_or("malformed MODULE-REPO reply")?.to_owned();

    for module in &invocation.requires {
        send(&mut writer, &format!("MODULE-IMPORT {module}"))?;
        let reply = read_reply(&mut reader)?;
        if !reply.starts_with("PATHNAME") {
            return Err(format!("MODULE-IMPORT {module} failed: {reply}").into());
        }
    }

    for module in &invocation.provides {
        send(&mut writer, &format!("MODULE-EXPORT {module}"))?;
        let reply = read_reply(&mut reader)?;
        let gcm_name = reply.strip_prefix("PATHNAME ").ok_or("malformed MODULE-EXPORT reply")?;
        std::fs::create_dir_all(&cmi_dir)?;
        std::fs::write(Path::new(&cmi_dir).join(gcm_name), b"")?;

        send(&mut writer, &format!("MODULE-COMPILED {module}"))?;
        let reply = read_reply(&mut reader)?;
        if reply != "OK" {
            return Err(format!("MODULE-COMPILED {module} failed: {reply}").into());
        }
    }

    if let Some(output) = &invocation.output {
        if let Some(parent) = Path::new(output).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, b"")?;
    }

    if let Some(depfile) = &invocation.depfile {
        let target = invocation.output.clone().unwrap_or_default();
        let dep = invocation.source.clone().unwrap_or_default();
        std::fs::write(depfile, format!("{target}: {dep}\n"))?;
    }

    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_argv(&args) {
        Ok(invocation) => invocation,
        Err(err) => {
            eprintln!("fakecc: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = run(&invocation) {
        eprintln!("fakecc: {err}");
        std::process::exit(1);
    }
}
