pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- articles table
CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    title TEXT,
    description TEXT,
    site_name TEXT,
    image_url TEXT,
    summary TEXT,
    language TEXT,
    word_count INTEGER NOT NULL DEFAULT 0,
    reading_time_seconds INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'error')),
    processing_attempts INTEGER NOT NULL DEFAULT 0 CHECK (processing_attempts >= 0),
    last_error TEXT,
    archived INTEGER NOT NULL DEFAULT 0,
    archived_at TEXT,
    rating INTEGER NOT NULL DEFAULT 0 CHECK (rating IN (-1, 0, 1)),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    processed_at TEXT,
    read_at TEXT,
    reading_position_element TEXT,
    reading_position_offset INTEGER
);

CREATE INDEX IF NOT EXISTS idx_articles_user_created ON articles(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_articles_status_updated ON articles(status, updated_at);

-- tags table (names unique per user on their Unicode-lowercased key)
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL,
    UNIQUE(user_id, name_key)
);

-- article_tags join table, replaced wholesale on every completion
CREATE TABLE IF NOT EXISTS article_tags (
    article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (article_id, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_article_tags_tag_id ON article_tags(tag_id);
"#;
