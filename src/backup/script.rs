/// Restore helper dropped next to each logical dump. The operator edits the
/// credential placeholders, then runs it against the target server.
pub fn render_restore_script(host: &str, port: u16, dbname: &str, ts: &str) -> String {
    let target_db = format!("{dbname}_restore_{ts}");
    format!(
        r#"#!/bin/bash
set -euo pipefail

export PGHOST='{host}'
export PGPORT='{port}'

# change these placeholders with real superuser name/pass
export PGUSER=postgres
export PGPASSWORD=postgres

# database to restore, the target
export RESTORE_TARGET_DB='{target_db}'
export RESTORE_GLOBALS=true

psql -v ON_ERROR_STOP=1 --username "${{PGUSER}}" <<-EOSQL
  CREATE DATABASE ${{RESTORE_TARGET_DB}} encoding 'UTF8';
EOSQL

# Roles like 'postgres' usually exist already; globals replay is allowed to
# skip such errors.
if [[ "${{RESTORE_GLOBALS:-false}}" = 'true' ]]; then
  psql --username "${{PGUSER}}" <globals.sql
fi

# additionally, you may use '--exit-on-error' flag here
pg_restore \
  --dbname="${{RESTORE_TARGET_DB}}" \
  --format=directory \
  --jobs=2 \
  --no-password \
  --verbose data
"#
    )
}
