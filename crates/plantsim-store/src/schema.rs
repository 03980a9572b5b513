/// SQL DDL for the plantsim database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT,
    config_id TEXT,
    config_snapshot TEXT,
    duration_days INTEGER NOT NULL DEFAULT 7,
    speed_factor INTEGER NOT NULL DEFAULT 60,
    status TEXT NOT NULL DEFAULT 'idle',
    created_at TEXT NOT NULL,
    started_at TEXT,
    expires_at TEXT,
    stopped_at TEXT,
    interrupted_at TEXT,
    simulated_timestamp INTEGER,
    current_tick INTEGER NOT NULL DEFAULT 0,
    last_snapshot_at TEXT
);

CREATE TABLE IF NOT EXISTS car_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    car_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    location TEXT,
    payload TEXT,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stop_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    stop_id TEXT NOT NULL,
    location TEXT NOT NULL,
    reason TEXT NOT NULL,
    stop_type TEXT NOT NULL,
    category TEXT NOT NULL,
    severity TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    duration_ms INTEGER,
    status TEXT NOT NULL DEFAULT 'IN_PROGRESS'
);

CREATE TABLE IF NOT EXISTS buffer_states (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    buffer_id TEXT NOT NULL,
    capacity INTEGER NOT NULL,
    current_count INTEGER NOT NULL,
    car_ids TEXT NOT NULL,
    status TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS plant_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    timestamp INTEGER NOT NULL,
    total_cars_produced INTEGER NOT NULL DEFAULT 0,
    cars_in_progress INTEGER NOT NULL DEFAULT 0,
    active_stops INTEGER NOT NULL DEFAULT 0,
    snapshot_data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS oee (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    date TEXT NOT NULL,
    location TEXT NOT NULL,
    availability REAL NOT NULL,
    performance REAL NOT NULL,
    quality REAL NOT NULL,
    oee REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS mttr_mtbf (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    date TEXT NOT NULL,
    location TEXT NOT NULL,
    mttr_ms REAL NOT NULL,
    mtbf_ms REAL NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
CREATE INDEX IF NOT EXISTS idx_car_events_session ON car_events(session_id);
CREATE INDEX IF NOT EXISTS idx_car_events_session_type ON car_events(session_id, event_type);
CREATE INDEX IF NOT EXISTS idx_stop_events_session ON stop_events(session_id);
CREATE INDEX IF NOT EXISTS idx_stop_events_session_status ON stop_events(session_id, status);
CREATE INDEX IF NOT EXISTS idx_buffer_states_session ON buffer_states(session_id, buffer_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_plant_snapshots_session ON plant_snapshots(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_oee_session_date ON oee(session_id, date);
CREATE INDEX IF NOT EXISTS idx_mttr_mtbf_session_date ON mttr_mtbf(session_id, date);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
