//! Purpose: Hold top-level CLI command dispatch for `framelog`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every store or index opened here is closed before the command returns.
//! Invariants: Validation never opens files through `Store`/`Index` (no locks, no preallocation).

use super::*;
use clap::CommandFactory;
use framelog::api::{
    Index, IndexOptions, LEN_WIDTH, Store, StoreOptions, ValidationStatus, validate,
};

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "framelog", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Store {
            buffer_bytes,
            command,
        } => {
            let options = StoreOptions::new(buffer_bytes);
            match command {
                StoreCommand::Append { store, data, file } => {
                    let payload = read_payload(data, file)?;
                    let store = Store::open_with(&store, options)?;
                    let (appended, size) = with_store(&store, |store| {
                        let appended = store.append(&payload)?;
                        Ok((appended, store.size()?))
                    })?;
                    emit_json(json!({
                        "path": store.path().display().to_string(),
                        "position": appended.position,
                        "frame_len": appended.frame_len,
                        "size": size,
                    }));
                    Ok(RunOutcome::ok())
                }
                StoreCommand::Read {
                    store,
                    position,
                    raw,
                } => {
                    let store = Store::open_with(&store, options)?;
                    let payload = with_store(&store, |store| store.read(position))?;
                    if raw {
                        write_raw(&payload)?;
                    } else {
                        emit_json(frame_json(position, &payload));
                    }
                    Ok(RunOutcome::ok())
                }
                StoreCommand::Dump { store } => {
                    let store = Store::open_with(&store, options)?;
                    let (frames, size) = with_store(&store, |store| {
                        let size = store.size()?;
                        let mut frames = Vec::new();
                        let mut position = 0;
                        while position < size {
                            let payload = store.read(position)?;
                            frames.push(frame_json(position, &payload));
                            position += LEN_WIDTH + payload.len() as u64;
                        }
                        Ok((frames, size))
                    })?;
                    emit_json(json!({
                        "path": store.path().display().to_string(),
                        "size": size,
                        "frames": frames,
                    }));
                    Ok(RunOutcome::ok())
                }
            }
        }
        Command::Index {
            max_index_bytes,
            command,
        } => {
            let options = IndexOptions::new(max_index_bytes);
            match command {
                IndexCommand::Write {
                    index,
                    offset,
                    position,
                } => {
                    let index = Index::open_with(&index, options)?;
                    let entries = with_index(&index, |index| {
                        index.write(offset, position)?;
                        index.len()
                    })?;
                    emit_json(json!({
                        "path": index.path().display().to_string(),
                        "offset": offset,
                        "position": position,
                        "entries": entries,
                    }));
                    Ok(RunOutcome::ok())
                }
                IndexCommand::Read { index, entry } => {
                    let index = Index::open_with(&index, options)?;
                    let found = with_index(&index, |index| index.read(entry))?;
                    emit_json(json!({
                        "path": index.path().display().to_string(),
                        "entry": entry,
                        "offset": found.offset,
                        "position": found.position,
                    }));
                    Ok(RunOutcome::ok())
                }
                IndexCommand::Dump { index } => {
                    let index = Index::open_with(&index, options)?;
                    let entries = with_index(&index, Index::entries)?;
                    emit_json(json!({
                        "path": index.path().display().to_string(),
                        "capacity": index.capacity(),
                        "entries": entries,
                    }));
                    Ok(RunOutcome::ok())
                }
            }
        }
        Command::Validate { store, index } => {
            let report = validate(&store, &index)?;
            let value = serde_json::to_value(&report).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode validation report")
                    .with_source(err)
            })?;
            emit_json(value);
            let exit_code = match report.status {
                ValidationStatus::Ok => 0,
                ValidationStatus::Corrupt => to_exit_code(ErrorKind::Corrupt),
            };
            Ok(RunOutcome::with_code(exit_code))
        }
    }
}

/// Runs `f` and closes the store afterwards; the first error wins.
fn with_store<T>(store: &Store, f: impl FnOnce(&Store) -> Result<T, Error>) -> Result<T, Error> {
    let result = f(store);
    let closed = store.close();
    let value = result?;
    closed?;
    Ok(value)
}

fn with_index<T>(index: &Index, f: impl FnOnce(&Index) -> Result<T, Error>) -> Result<T, Error> {
    let result = f(index);
    let closed = index.close();
    let value = result?;
    closed?;
    Ok(value)
}
