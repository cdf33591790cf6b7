pub const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS version (
    version INTEGER UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    height BIGINT PRIMARY KEY,
    block_hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payments (
    txid TEXT PRIMARY KEY,
    creator_id TEXT NOT NULL,
    payment_type SMALLINT NOT NULL,
    content_id BIGINT,
    sender_address TEXT,
    amount_sats BIGINT NOT NULL CHECK (amount_sats >= 0),
    payload_hex TEXT NOT NULL,
    block_height BIGINT NOT NULL,
    block_hash TEXT NOT NULL,
    confirmed_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS payments_block_height ON payments (block_height);

CREATE TABLE IF NOT EXISTS creators (
    creator_id TEXT PRIMARY KEY,
    contract_address TEXT NOT NULL
);

INSERT INTO version (version) VALUES (1) ON CONFLICT DO NOTHING;
";
