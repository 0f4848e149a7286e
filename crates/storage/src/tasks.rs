#![forbid(unsafe_code)]

use super::*;
use cd_core::ids::TaskId;
use cd_core::select::TaskFacts;

const TASK_COLUMNS: &str =
    "id, title, description, state, priority, owner, tags, dependencies, created_at_ms, updated_at_ms";

impl SqliteStore {
    pub fn create_task(&mut self, new: NewTask) -> Result<TaskRow, StoreError> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(StoreError::InvalidInput("task title must not be empty"));
        }

        let now_ms = now_ms();
        let tx = self.conn.transaction()?;

        let id = match new.id {
            Some(raw) => {
                let id = TaskId::try_new(raw)
                    .map_err(|_| StoreError::InvalidInput("task id has invalid characters"))?
                    .into_string();
                if load_task(&tx, &id)?.is_some() {
                    return Err(StoreError::InvalidInput("task id already exists"));
                }
                id
            }
            None => {
                let seq = next_counter_tx(&tx, "task_seq")?;
                format!("TASK-{seq:03}")
            }
        };

        for dep_id in &new.dependencies {
            if dep_id == &id {
                return Err(StoreError::InvalidInput("task cannot depend on itself"));
            }
            if load_task(&tx, dep_id)?.is_none() {
                return Err(StoreError::UnknownTask(dep_id.clone()));
            }
        }

        let state = new.state.unwrap_or(TaskState::ReadyForPlan);
        let priority = new.priority.unwrap_or(5);

        tx.execute(
            r#"
            INSERT INTO tasks(id,title,description,state,priority,owner,tags,dependencies,created_at_ms,updated_at_ms)
            VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
            "#,
            params![
                id,
                title,
                new.description,
                state.as_str(),
                priority,
                new.owner,
                encode_string_list(&new.tags),
                encode_string_list(&new.dependencies),
                now_ms,
                now_ms
            ],
        )?;
        tx.commit()?;

        Ok(TaskRow {
            id,
            title,
            description: new.description,
            state,
            priority,
            owner: new.owner,
            tags: new.tags,
            dependencies: new.dependencies,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        })
    }

    pub fn get_task(&self, id: &str) -> Result<TaskRow, StoreError> {
        load_task(&self.conn, id)?.ok_or_else(|| StoreError::UnknownTask(id.to_string()))
    }

    pub fn list_tasks(&self, filters: &TaskFilters) -> Result<Vec<TaskRow>, StoreError> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(state) = filters.state {
            sql.push_str(" AND state = ?");
            args.push(state.as_str().to_string().into());
        }
        if let Some(priority) = filters.priority {
            sql.push_str(" AND priority = ?");
            args.push(priority.into());
        }
        if let Some(owner) = &filters.owner {
            sql.push_str(" AND owner = ?");
            args.push(owner.clone().into());
        }
        sql.push_str(" ORDER BY priority DESC, updated_at_ms ASC, id ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), task_row_from)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Every task in the store, terminal ones included, as selector facts.
    pub fn selection_snapshot(&self) -> Result<Vec<TaskFacts>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, state, priority, created_at_ms, updated_at_ms, dependencies \
             FROM tasks ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut facts = Vec::new();
        for row in rows {
            let (id, title, state, priority, created_at_ms, updated_at_ms, deps) = row?;
            facts.push(TaskFacts {
                id,
                title,
                state: parse_state_or_default(&state),
                priority,
                created_at_ms,
                updated_at_ms,
                dependencies: decode_string_list(&deps),
            });
        }
        Ok(facts)
    }

    /// Appends a note to the task's note stream without changing state. The
    /// task's `updated_at_ms` still advances: a note is a mutation.
    pub fn append_task_note(
        &mut self,
        task_id: &str,
        actor: Option<&str>,
        note: &str,
    ) -> Result<TaskNoteRow, StoreError> {
        let note = note.trim();
        if note.is_empty() {
            return Err(StoreError::InvalidInput("note must not be empty"));
        }

        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let Some(task) = load_task(&tx, task_id)? else {
            return Err(StoreError::UnknownTask(task_id.to_string()));
        };

        tx.execute(
            "INSERT INTO task_notes(task_id, ts_ms, actor, note) VALUES (?1, ?2, ?3, ?4)",
            params![task.id, now_ms, actor, note],
        )?;
        let seq = tx.last_insert_rowid();
        bump_task_updated_at_tx(&tx, &task.id, task.updated_at_ms, now_ms)?;
        tx.commit()?;

        Ok(TaskNoteRow {
            seq,
            task_id: task.id,
            ts_ms: now_ms,
            actor: actor.map(|s| s.to_string()),
            note: note.to_string(),
        })
    }

    pub fn list_task_notes(&self, task_id: &str) -> Result<Vec<TaskNoteRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, task_id, ts_ms, actor, note FROM task_notes WHERE task_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(TaskNoteRow {
                seq: row.get(0)?,
                task_id: row.get(1)?,
                ts_ms: row.get(2)?,
                actor: row.get(3)?,
                note: row.get(4)?,
            })
        })?;
        let mut notes = Vec::new();
        for row in rows {
            notes.push(row?);
        }
        Ok(notes)
    }

    pub fn upsert_agent(&mut self, agent: &AgentRow) -> Result<(), StoreError> {
        let now_ms = now_ms();
        self.conn.execute(
            r#"
            INSERT INTO agents(role, description, allowed_states, can_transition_to,
                               can_read_plan, can_execute_commands, can_update_artifacts,
                               prompt_template, updated_at_ms)
            VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
            ON CONFLICT(role) DO UPDATE SET
              description=excluded.description,
              allowed_states=excluded.allowed_states,
              can_transition_to=excluded.can_transition_to,
              can_read_plan=excluded.can_read_plan,
              can_execute_commands=excluded.can_execute_commands,
              can_update_artifacts=excluded.can_update_artifacts,
              prompt_template=excluded.prompt_template,
              updated_at_ms=excluded.updated_at_ms
            "#,
            params![
                agent.role,
                agent.description,
                encode_string_list(&agent.allowed_states),
                encode_string_list(&agent.can_transition_to),
                agent.can_read_plan as i64,
                agent.can_execute_commands as i64,
                agent.can_update_artifacts as i64,
                agent.prompt_template,
                now_ms
            ],
        )?;
        Ok(())
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT role, description, allowed_states, can_transition_to, can_read_plan, \
             can_execute_commands, can_update_artifacts, prompt_template, updated_at_ms \
             FROM agents ORDER BY role ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;
        let mut agents = Vec::new();
        for row in rows {
            let (
                role,
                description,
                allowed_states,
                can_transition_to,
                can_read_plan,
                can_execute_commands,
                can_update_artifacts,
                prompt_template,
                updated_at_ms,
            ) = row?;
            agents.push(AgentRow {
                role,
                description,
                allowed_states: decode_string_list(&allowed_states),
                can_transition_to: decode_string_list(&can_transition_to),
                can_read_plan: can_read_plan != 0,
                can_execute_commands: can_execute_commands != 0,
                can_update_artifacts: can_update_artifacts != 0,
                prompt_template,
                updated_at_ms,
            });
        }
        Ok(agents)
    }
}

pub(crate) fn load_task(conn: &Connection, id: &str) -> Result<Option<TaskRow>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_row_from,
        )
        .optional()?;
    Ok(row)
}

/// `updated_at_ms` must strictly increase on every mutation, even when two
/// writes land in the same wall-clock millisecond.
pub(crate) fn bump_task_updated_at_tx(
    tx: &Transaction<'_>,
    task_id: &str,
    prev_updated_at_ms: i64,
    now_ms: i64,
) -> Result<i64, StoreError> {
    let updated_at_ms = now_ms.max(prev_updated_at_ms + 1);
    tx.execute(
        "UPDATE tasks SET updated_at_ms = ?2 WHERE id = ?1",
        params![task_id, updated_at_ms],
    )?;
    Ok(updated_at_ms)
}

fn task_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    let state: String = row.get(3)?;
    let tags: String = row.get(6)?;
    let dependencies: String = row.get(7)?;
    Ok(TaskRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        state: parse_state_or_default(&state),
        priority: row.get(4)?,
        owner: row.get(5)?,
        tags: decode_string_list(&tags),
        dependencies: decode_string_list(&dependencies),
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
    })
}
