pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dist_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_key TEXT NOT NULL,
        task_type TEXT NOT NULL,
        state TEXT NOT NULL,
        step INTEGER NOT NULL,
        concurrency INTEGER NOT NULL,
        owner TEXT,
        owner_epoch INTEGER NOT NULL DEFAULT 0,
        meta TEXT NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        start_time TEXT,
        end_time TEXT,
        state_update_time TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_dist_tasks_key ON dist_tasks (task_key)",
    r#"
    CREATE TABLE IF NOT EXISTS dist_subtasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        step INTEGER NOT NULL,
        ordinal INTEGER NOT NULL,
        exec_id TEXT,
        state TEXT NOT NULL,
        claim_token INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        meta TEXT NOT NULL,
        summary TEXT,
        row_count INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        create_time TEXT NOT NULL,
        start_time TEXT,
        update_time TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_dist_subtasks_ordinal ON dist_subtasks (task_id, step, ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_dist_subtasks_exec ON dist_subtasks (exec_id, state)",
    r#"
    CREATE TABLE IF NOT EXISTS dist_nodes (
        exec_id TEXT PRIMARY KEY,
        epoch INTEGER NOT NULL,
        can_be_owner INTEGER NOT NULL,
        last_heartbeat_ms INTEGER NOT NULL,
        registered_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dist_node_epochs (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_epoch INTEGER NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO dist_node_epochs (id, last_epoch) VALUES (1, 0)",
];
