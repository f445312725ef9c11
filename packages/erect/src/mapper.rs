//! GCC `-fmodule-mapper` protocol server.
//!
//! Binds a loopback-only TCP listener and speaks the subset of GCC's
//! module-mapper protocol described in the engine design: `HELLO`,
//! `MODULE-REPO`, `MODULE-EXPORT`, `MODULE-IMPORT`, `MODULE-COMPILED`, and
//! `INCLUDE-TRANSLATE`. Each connection is attributed to the [`Task`] that
//! spawned the compiler holding it, by looking up a composite key derived
//! from the `ident` the compiler was launched with.

use std::sync::{Arc, OnceLock};

use color_eyre::{Result, eyre::Context as _};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{instrument, trace, warn};

use crate::{
    context::Context,
    id::TaskId,
    path::AbsDirPath,
    registry::ModuleRegistry,
    task::Task,
};

/// The two kinds of task the mapper will try attributing a connection to,
/// in order. GCC's `HELLO` line doesn't distinguish a header-unit compile
/// from an ordinary translation-unit compile, so we try both composite
/// keys built from the same ident and take whichever task exists.
const ATTRIBUTION_KINDS: [&str; 2] = ["compile", "header_module"];

pub struct Mapper {
    ctx: Context,
    registry: Arc<ModuleRegistry>,
    build_dir: AbsDirPath,
    cmi_dir: AbsDirPath,
    port: OnceLock<u16>,
}

impl Mapper {
    pub fn new(ctx: Context, registry: Arc<ModuleRegistry>, build_dir: AbsDirPath, cmi_dir: AbsDirPath) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry,
            build_dir,
            cmi_dir,
            port: OnceLock::new(),
        })
    }

    /// The ephemeral port this mapper is listening on. Panics if called
    /// before the server has finished binding (i.e. before the
    /// `start_coros` phase has completed).
    pub fn port(&self) -> u16 {
        *self.port.get().expect("mapper not yet bound")
    }

    /// Bind the listening socket and spawn the accept loop. Intended to be
    /// registered via [`Context::start_async`] so it completes before any
    /// compile task runs and needs the port number.
    #[instrument(skip(self))]
    pub async fn bind(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("::1", 0))
            .await
            .context("bind module mapper socket")?;
        let port = listener.local_addr().context("read bound port")?.port();
        self.port.set(port).expect("bind called twice");
        trace!(port, "module mapper listening");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.accept_loop(listener).await });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = this.handle_connection(stream).await {
                            warn!(?err, "module mapper connection ended with an error");
                        }
                    });
                }
                Err(err) => {
                    warn!(?err, "module mapper accept failed, stopping accept loop");
                    return;
                }
            }
        }
    }

    /// GCC corks a block of requests by sending several lines in a row whose
    /// last whitespace-separated token is a standalone `;`, meaning "buffer
    /// me, more to come"; the first line without one ends the block. On
    /// flush, every response but the last gets ` ;` appended so the
    /// compiler's reader can tell where the block ends.
    #[instrument(skip(self, stream))]
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut attached: Option<Arc<Task>> = None;
        let mut queue: Vec<String> = Vec::new();

        while let Some(line) = lines.next_line().await.context("read mapper line")? {
            let mut tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.last() == Some(&";") {
                tokens.pop();
                queue.push(tokens.join(" "));
                continue;
            }
            queue.push(tokens.join(" "));

            while queue.len() > 1 {
                let request = queue.remove(0);
                let response = self.handle_request(&request, &mut attached).await;
                write_half
                    .write_all(format!("{response} ;\n").as_bytes())
                    .await
                    .context("write mapper response")?;
            }
            let request = queue.remove(0);
            let response = self.handle_request(&request, &mut attached).await;
            write_half
                .write_all(format!("{response}\n").as_bytes())
                .await
                .context("write mapper response")?;
        }
        Ok(())
    }

    async fn handle_request(&self, request: &str, attached: &mut Option<Arc<Task>>) -> String {
        let mut parts = request.split_whitespace();
        let Some(command) = parts.next() else {
            return "ERROR".to_owned();
        };
        let rest: Vec<&str> = parts.collect();

        match command {
            "HELLO" => {
                // HELLO <version> <compiler> <ident>
                let Some(ident) = rest.get(2) else {
                    return "ERROR".to_owned();
                };
                *attached = self.attribute(ident);
                if attached.is_none() {
                    warn!(ident, "module mapper could not attribute connection to a task");
                }
                "HELLO 1 erect-modmap".to_owned()
            }
            "MODULE-REPO" => format!("PATHNAME {}", self.cmi_dir.as_str_lossy()),
            "MODULE-EXPORT" => {
                let Some(module) = rest.first() else {
                    return "ERROR".to_owned();
                };
                format!("PATHNAME {}", gcm_name(module))
            }
            "MODULE-IMPORT" => {
                let Some(module) = rest.first() else {
                    return "ERROR".to_owned();
                };
                self.import(module, attached).await
            }
            "MODULE-COMPILED" => {
                let Some(module) = rest.first() else {
                    return "ERROR".to_owned();
                };
                self.compiled(module, attached).await;
                "OK".to_owned()
            }
            "INCLUDE-TRANSLATE" => "BOOL FALSE".to_owned(),
            _ => "ERROR".to_owned(),
        }
    }

    fn attribute(&self, ident: &str) -> Option<Arc<Task>> {
        ATTRIBUTION_KINDS.iter().find_map(|kind| {
            let id = TaskId::new([*kind, self.build_dir.as_str_lossy().as_ref(), ident]);
            self.ctx.find_task(&id)
        })
    }

    async fn import(&self, module: &str, attached: &Option<Arc<Task>>) -> String {
        match attached {
            Some(task) => {
                task.mark_suspended(self.registry.module_required(module)).await;
                task.record_module_required(module);
                format!("PATHNAME {}", gcm_name(module))
            }
            None => {
                // No attributed task: still honor the protocol (nothing
                // else to block on) rather than hanging the compiler.
                self.registry.module_required(module).await;
                format!("PATHNAME {}", gcm_name(module))
            }
        }
    }

    async fn compiled(&self, module: &str, attached: &Option<Arc<Task>>) {
        if let Some(task) = attached {
            task.record_module_generated(module);
        }
        self.registry.module_provided(module);
    }
}

/// The CMI filename for `module`: `/` replaced by `,`, with a `.gcm`
/// extension.
pub fn gcm_name(module: &str) -> String {
    format!("{}.gcm", module.replace('/', ","))
}
