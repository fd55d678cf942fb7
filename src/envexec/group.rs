use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::cmd::{Cmd, ExecResult};
use super::pipe::{NewStoreFile, Pipe};
use super::prepare::prepare_fds;
use super::run::run_single;
use super::util::new_memfd_store;

/// Several commands running concurrently, connected by pipes
pub struct Group {
    pub cmds: Vec<Cmd>,
    pub pipes: Vec<Pipe>,
    /// Creates the store files backing proxy captures
    pub new_store_file: NewStoreFile,
}

impl Group {
    pub fn new(cmds: Vec<Cmd>, pipes: Vec<Pipe>) -> Self {
        Self {
            cmds,
            pipes,
            new_store_file: Arc::new(new_memfd_store),
        }
    }

    /// Prepares every fd table, then runs all commands and waits for all
    /// of them. A command failing inside the engine only marks its own
    /// slot as `Internal Error`; `Err` is returned when preparation fails.
    pub async fn run(self, ctx: &CancellationToken) -> anyhow::Result<Vec<ExecResult>> {
        let Group {
            mut cmds,
            pipes,
            new_store_file,
        } = self;
        let prepared = prepare_fds(&mut cmds, &pipes, &new_store_file)?;

        let mut tasks = JoinSet::new();
        for (index, (cmd, prepared)) in cmds.into_iter().zip(prepared).enumerate() {
            let ctx = ctx.clone();
            tasks.spawn(async move { (index, run_single(&ctx, cmd, prepared).await) });
        }

        let mut results: Vec<ExecResult> = Vec::new();
        results.resize_with(tasks.len(), ExecResult::default);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(result))) => results[index] = result,
                Ok((index, Err(e))) => {
                    log::error!("group cmd {index} failed: {e:#}");
                    results[index] = ExecResult::internal_error(format!("{e:#}"));
                }
                Err(e) => {
                    // the slot keeps its Invalid default and is reported below
                    log::error!("group task failed: {e}");
                }
            }
        }
        for result in results.iter_mut().filter(|r| r.status == Default::default()) {
            *result = ExecResult::internal_error("command did not finish");
        }
        Ok(results)
    }
}
