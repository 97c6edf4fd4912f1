//! Purpose: Hold top-level CLI command dispatch for `tabula`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each invocation opens the directory, loads only what it needs, and writes directly.
//! Invariants: Helpers in `main.rs` remain the source of argument parsing and output envelopes.

use super::*;

pub(super) fn dispatch_command(command: Command, table_dir: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Serve(run) => {
            let config = serve_config_from_run_args(run, &table_dir)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Table { command } => match command {
            TableCommand::Create {
                name,
                schema,
                strict,
            } => {
                let schema = parse_schema(schema.as_deref(), strict)?;
                let mut db = Database::open(&table_dir)?;
                let info = db.create_table(&name, schema)?;
                emit_json(json!({ "table": table_info_json(&info) }));
                Ok(RunOutcome::ok())
            }
            TableCommand::List => {
                let db = Database::open(&table_dir)?;
                let tables = db.stored_tables()?;
                emit_json(json!({ "tables": tables }));
                Ok(RunOutcome::ok())
            }
            TableCommand::Drop { name } => {
                let mut db = Database::open(&table_dir)?;
                db.drop_table(&name)
                    .map_err(|err| add_missing_table_hint(err, &name))?;
                emit_json(json!({ "dropped": name }));
                Ok(RunOutcome::ok())
            }
            TableCommand::Info { name } => {
                let db = open_table(&table_dir, &name)?;
                let info = db.table_info(&name)?;
                emit_json(json!({ "table": table_info_json(&info) }));
                Ok(RunOutcome::ok())
            }
        },
        Command::Insert { table, data, key } => {
            let record = parse_record(&data)?;
            let mut db = open_table(&table_dir, &table)?;
            match key.as_deref() {
                Some(key) => db.insert_unique(&table, record, key)?,
                None => db.insert(&table, record)?,
            }
            emit_json(json!({ "table": table, "inserted": 1 }));
            Ok(RunOutcome::ok())
        }
        Command::Select { table, filter } => {
            let filter = parse_filter(filter.as_deref())?;
            let db = open_table(&table_dir, &table)?;
            let rows = db.select(&table, &filter)?;
            emit_json(json!({ "table": table, "count": rows.len(), "rows": rows_json(&rows) }));
            Ok(RunOutcome::ok())
        }
        Command::Update { table, filter, set } => {
            let filter = parse_filter(filter.as_deref())?;
            let changes = parse_record(&set)?;
            let mut db = open_table(&table_dir, &table)?;
            let updated = db.update(&table, &filter, &changes)?;
            emit_json(json!({ "table": table, "updated": updated }));
            Ok(RunOutcome::ok())
        }
        Command::Delete { table, filter } => {
            let filter = parse_filter(filter.as_deref())?;
            let mut db = open_table(&table_dir, &table)?;
            let deleted = db.delete(&table, &filter)?;
            emit_json(json!({ "table": table, "deleted": deleted }));
            Ok(RunOutcome::ok())
        }
        Command::Backup { table } => {
            let db = open_table(&table_dir, &table)?;
            let path = db.backup(&table)?;
            emit_json(json!({
                "backup": { "table": table, "path": path.display().to_string() }
            }));
            Ok(RunOutcome::ok())
        }
        Command::Export {
            table,
            path,
            format,
        } => {
            let format = ExportFormat::from(format);
            let db = open_table(&table_dir, &table)?;
            let rows = db.export(&table, &path, format)?;
            emit_json(json!({
                "export": {
                    "table": table,
                    "path": path.display().to_string(),
                    "format": format.extension(),
                    "rows": rows,
                }
            }));
            Ok(RunOutcome::ok())
        }
    }
}
