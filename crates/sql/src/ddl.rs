//! DDL plan generation for temporal tables.
//!
//! Pure functions from table/column/index specifications to the SQL
//! statements the compiler executes. Identifiers and literals are quoted
//! through `chronopg_core::quoting`; nothing caller-supplied is spliced
//! raw.
//!
//! The INSTEAD rules embed the table's column list, so any column change
//! invalidates them; the compiler rebuilds the view and rules after such
//! changes.

use chronopg_core::quoting::{quote_ident, quote_literal, quote_qualified};
use chronopg_core::types::{ColumnSpec, IndexSpec, TableSpec};

use crate::{HISTORY_SCHEMA, PUBLIC_SCHEMA, TEMPORAL_SCHEMA};

/// End-of-time literal used as the open bound of current versions.
pub const END_OF_TIME_LITERAL: &str = "'9999-12-31'";

/// UTC "now" expression; `timestamp without time zone` columns always
/// hold UTC instants.
pub const UTC_NOW: &str = "timezone('UTC', now())";

fn column_sql(column: &ColumnSpec) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name), column.sql_type);
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    sql
}

fn column_list(spec: &TableSpec) -> String {
    let mut parts = Vec::with_capacity(spec.columns.len() + 1);
    if let Some(pk) = &spec.primary_key {
        parts.push(format!("{} BIGSERIAL PRIMARY KEY", quote_ident(pk)));
    }
    parts.extend(spec.columns.iter().map(column_sql));
    parts.join(",\n  ")
}

/// `CREATE SCHEMA` for one of the reserved schemas.
pub fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA {}", quote_ident(schema))
}

/// The current-state table under the `temporal` schema.
pub fn create_current_table(spec: &TableSpec) -> String {
    format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_qualified(TEMPORAL_SCHEMA, &spec.name),
        column_list(spec),
    )
}

/// A plain table under `public`, for the non-temporal path.
pub fn create_plain_table(spec: &TableSpec) -> String {
    format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_qualified(PUBLIC_SCHEMA, &spec.name),
        column_list(spec),
    )
}

/// The history table: INHERITS the current table and adds the system
/// columns, the timeline CHECK, and the GiST exclusion constraint that
/// forbids overlapping validity intervals for the same logical record.
pub fn create_history_table(table: &str, pk: &str) -> String {
    let pk = quote_ident(pk);
    format!(
        "CREATE TABLE {history} (\n  \
           \"hid\" BIGSERIAL PRIMARY KEY,\n  \
           \"valid_from\" timestamp NOT NULL,\n  \
           \"valid_to\" timestamp NOT NULL DEFAULT {eot},\n  \
           \"recorded_at\" timestamp NOT NULL DEFAULT {now},\n  \
           CONSTRAINT {check_name} CHECK (\"valid_from\" < \"valid_to\"),\n  \
           CONSTRAINT {excl_name} EXCLUDE USING gist (\n    \
             box(\n      \
               point(date_part('epoch', \"valid_from\"), {pk}),\n      \
               point(date_part('epoch', \"valid_to\" - INTERVAL '1 millisecond'), {pk})\n    \
             ) WITH &&\n  )\n\
         ) INHERITS ({current})",
        history = quote_qualified(HISTORY_SCHEMA, table),
        current = quote_qualified(TEMPORAL_SCHEMA, table),
        eot = END_OF_TIME_LITERAL,
        now = UTC_NOW,
        check_name = quote_ident(&format!("{table}_timeline_consistency")),
        excl_name = quote_ident(&format!("{table}_overlapping_periods")),
    )
}

/// The two history indexes: validity lookups never update in place, so
/// the interval index packs full; the record index leaves room for the
/// closing update of the open row.
pub fn history_indexes(table: &str, pk: &str) -> [String; 2] {
    let history = quote_qualified(HISTORY_SCHEMA, table);
    [
        format!(
            "CREATE INDEX {} ON {} USING btree (\"valid_from\", \"valid_to\") WITH (fillfactor = 100)",
            quote_ident(&format!("index_{table}_history_on_validity")),
            history,
        ),
        format!(
            "CREATE INDEX {} ON {} USING btree ({}) WITH (fillfactor = 90)",
            quote_ident(&format!("index_{table}_history_on_{pk}")),
            history,
            quote_ident(pk),
        ),
    ]
}

/// The presentation view over the current table only.
pub fn create_view(table: &str) -> String {
    let current = quote_qualified(TEMPORAL_SCHEMA, table);
    format!(
        "CREATE VIEW {} AS SELECT {}.* FROM ONLY {current}",
        quote_qualified(PUBLIC_SCHEMA, table),
        quote_ident(table),
    )
}

/// Drop the presentation view; its INSTEAD rules go with it.
pub fn drop_view(table: &str) -> String {
    format!("DROP VIEW {}", quote_qualified(PUBLIC_SCHEMA, table))
}

fn sequence_literal(table: &str, pk: &str) -> String {
    quote_literal(&format!(
        "{TEMPORAL_SCHEMA}.{}",
        quote_ident(&format!("{table}_{pk}_seq"))
    ))
}

/// The INSERT rule: write the current row first so the primary-key
/// sequence advances, then record the opening history row with the key
/// read back through `currval`.
pub fn insert_rule(table: &str, pk: &str, columns: &[String]) -> String {
    let view = quote_qualified(PUBLIC_SCHEMA, table);
    let current = quote_qualified(TEMPORAL_SCHEMA, table);
    let history = quote_qualified(HISTORY_SCHEMA, table);
    let pk_ident = quote_ident(pk);

    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let news: Vec<String> = columns
        .iter()
        .map(|c| format!("NEW.{}", quote_ident(c)))
        .collect();

    let current_insert = if quoted.is_empty() {
        format!("INSERT INTO {current} DEFAULT VALUES")
    } else {
        format!(
            "INSERT INTO {current} ( {} )\n  VALUES ( {} )",
            quoted.join(", "),
            news.join(", "),
        )
    };

    let mut history_columns = vec![pk_ident.clone()];
    history_columns.extend(quoted.iter().cloned());
    history_columns.push("\"valid_from\"".to_string());

    let mut history_values = vec![format!("currval({})", sequence_literal(table, pk))];
    history_values.extend(news.iter().cloned());
    history_values.push(UTC_NOW.to_string());

    let mut returning = vec![pk_ident];
    returning.extend(quoted);

    format!(
        "CREATE OR REPLACE RULE {rule} AS ON INSERT TO {view} DO INSTEAD (\n\n  \
           {current_insert};\n\n  \
           INSERT INTO {history} ( {hist_cols} )\n  \
           VALUES ( {hist_vals} )\n  \
           RETURNING {returning}\n)",
        rule = quote_ident(&format!("{table}_ins")),
        hist_cols = history_columns.join(", "),
        hist_vals = history_values.join(", "),
        returning = returning.join(", "),
    )
}

/// The UPDATE rule. Statement order is load-bearing: the open history
/// row must be closed before the replacement is inserted, or the
/// exclusion constraint fires on the overlap. `now()` is evaluated once
/// per statement, so the closed `valid_to` equals the new `valid_from`.
pub fn update_rule(table: &str, pk: &str, columns: &[String]) -> String {
    let view = quote_qualified(PUBLIC_SCHEMA, table);
    let current = quote_qualified(TEMPORAL_SCHEMA, table);
    let history = quote_qualified(HISTORY_SCHEMA, table);
    let pk_ident = quote_ident(pk);

    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let news: Vec<String> = columns
        .iter()
        .map(|c| format!("NEW.{}", quote_ident(c)))
        .collect();

    let assignments = if quoted.is_empty() {
        format!("{pk_ident} = OLD.{pk_ident}")
    } else {
        quoted
            .iter()
            .zip(news.iter())
            .map(|(col, new)| format!("{col} = {new}"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut history_columns = vec![pk_ident.clone()];
    history_columns.extend(quoted.iter().cloned());
    history_columns.push("\"valid_from\"".to_string());

    let mut history_values = vec![format!("OLD.{pk_ident}")];
    history_values.extend(news.iter().cloned());
    history_values.push(UTC_NOW.to_string());

    format!(
        "CREATE OR REPLACE RULE {rule} AS ON UPDATE TO {view} DO INSTEAD (\n\n  \
           UPDATE {history}\n     \
              SET \"valid_to\" = {now}\n   \
            WHERE {pk_ident} = OLD.{pk_ident} AND \"valid_to\" = {eot};\n\n  \
           INSERT INTO {history} ( {hist_cols} )\n  \
           VALUES ( {hist_vals} );\n\n  \
           UPDATE ONLY {current}\n     \
              SET {assignments}\n   \
            WHERE {pk_ident} = OLD.{pk_ident}\n)",
        rule = quote_ident(&format!("{table}_upd")),
        now = UTC_NOW,
        eot = END_OF_TIME_LITERAL,
        hist_cols = history_columns.join(", "),
        hist_vals = history_values.join(", "),
    )
}

/// The DELETE rule: close the open history row, then remove the current
/// row. The historical trail remains.
pub fn delete_rule(table: &str, pk: &str) -> String {
    let view = quote_qualified(PUBLIC_SCHEMA, table);
    let current = quote_qualified(TEMPORAL_SCHEMA, table);
    let history = quote_qualified(HISTORY_SCHEMA, table);
    let pk_ident = quote_ident(pk);

    format!(
        "CREATE OR REPLACE RULE {rule} AS ON DELETE TO {view} DO INSTEAD (\n\n  \
           UPDATE {history}\n     \
              SET \"valid_to\" = {now}\n   \
            WHERE {pk_ident} = OLD.{pk_ident} AND \"valid_to\" = {eot};\n\n  \
           DELETE FROM ONLY {current}\n   \
            WHERE {pk_ident} = OLD.{pk_ident}\n)",
        rule = quote_ident(&format!("{table}_del")),
        now = UTC_NOW,
        eot = END_OF_TIME_LITERAL,
    )
}

/// The three INSTEAD rules, in declaration order.
pub fn rules(table: &str, pk: &str, columns: &[String]) -> [String; 3] {
    [
        insert_rule(table, pk, columns),
        update_rule(table, pk, columns),
        delete_rule(table, pk),
    ]
}

/// The full creation plan for a temporal table: schemas are assumed to
/// exist (engine bootstrap creates them); the plan runs inside one
/// transaction.
pub fn create_table_plan(spec: &TableSpec, pk: &str) -> Vec<String> {
    let columns: Vec<String> = spec.columns.iter().map(|c| c.name.clone()).collect();

    let mut plan = vec![
        create_current_table(spec),
        create_history_table(&spec.name, pk),
    ];
    plan.extend(history_indexes(&spec.name, pk));
    plan.push(create_view(&spec.name));
    plan.extend(rules(&spec.name, pk, &columns));
    plan
}

/// Rename a temporal table: both physical tables, both surrogate-key
/// sequences, and the presentation view.
pub fn rename_table_plan(old: &str, new: &str, pk: &str) -> Vec<String> {
    vec![
        format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_qualified(TEMPORAL_SCHEMA, old),
            quote_ident(new),
        ),
        format!(
            "ALTER SEQUENCE {} RENAME TO {}",
            quote_qualified(TEMPORAL_SCHEMA, &format!("{old}_{pk}_seq")),
            quote_ident(&format!("{new}_{pk}_seq")),
        ),
        format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_qualified(HISTORY_SCHEMA, old),
            quote_ident(new),
        ),
        format!(
            "ALTER SEQUENCE {} RENAME TO {}",
            quote_qualified(HISTORY_SCHEMA, &format!("{old}_hid_seq")),
            quote_ident(&format!("{new}_hid_seq")),
        ),
        format!(
            "ALTER VIEW {} RENAME TO {}",
            quote_qualified(PUBLIC_SCHEMA, old),
            quote_ident(new),
        ),
    ]
}

/// Rename a plain table under `public`.
pub fn rename_plain_table(old: &str, new: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_qualified(PUBLIC_SCHEMA, old),
        quote_ident(new),
    )
}

/// Drop the current table; CASCADE removes the inherited history table,
/// the view, and the rules.
pub fn drop_table_cascade(table: &str) -> String {
    format!(
        "DROP TABLE {} CASCADE",
        quote_qualified(TEMPORAL_SCHEMA, table)
    )
}

/// Drop a plain table under `public`.
pub fn drop_plain_table(table: &str) -> String {
    format!("DROP TABLE {}", quote_qualified(PUBLIC_SCHEMA, table))
}

/// Add a column to the current table; the inherited history table picks
/// it up through inheritance.
pub fn add_column(schema: &str, table: &str, column: &ColumnSpec) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_qualified(schema, table),
        column_sql(column),
    )
}

/// Rename a column on the current table (propagates to the child).
pub fn rename_column(schema: &str, table: &str, old: &str, new: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        quote_qualified(schema, table),
        quote_ident(old),
        quote_ident(new),
    )
}

/// Change a column's type. Unqualified: the compiler runs this under the
/// target schema's search_path.
pub fn change_column_type(table: &str, column: &str, sql_type: &str) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
        quote_ident(table),
        quote_ident(column),
        sql_type,
    )
}

/// Drop a column. Unqualified, for in-schema execution.
pub fn remove_column(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(table),
        quote_ident(column),
    )
}

/// Set or drop a column default.
pub fn change_column_default(
    schema: &str,
    table: &str,
    column: &str,
    default: Option<&str>,
) -> String {
    match default {
        Some(expr) => format!(
            "ALTER TABLE ONLY {} ALTER COLUMN {} SET DEFAULT {}",
            quote_qualified(schema, table),
            quote_ident(column),
            expr,
        ),
        None => format!(
            "ALTER TABLE ONLY {} ALTER COLUMN {} DROP DEFAULT",
            quote_qualified(schema, table),
            quote_ident(column),
        ),
    }
}

/// Set or drop a NOT NULL constraint.
pub fn change_column_null(schema: &str, table: &str, column: &str, nullable: bool) -> String {
    let action = if nullable { "DROP" } else { "SET" };
    format!(
        "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL",
        quote_qualified(schema, table),
        quote_ident(column),
        action,
    )
}

/// `CREATE INDEX` in the given schema. With `strip_unique`, a UNIQUE
/// request degrades to a plain index: uniqueness is incompatible with
/// multiple versions of the same logical row.
pub fn create_index(schema: &str, table: &str, index: &IndexSpec, strip_unique: bool) -> String {
    let unique = if index.unique && !strip_unique {
        "UNIQUE "
    } else {
        ""
    };
    let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "CREATE {unique}INDEX {} ON {} ({})",
        quote_ident(&index.name_for(table)),
        quote_qualified(schema, table),
        columns.join(", "),
    )
}

/// `DROP INDEX` in the given schema.
pub fn drop_index(schema: &str, name: &str) -> String {
    format!("DROP INDEX {}", quote_qualified(schema, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronopg_core::types::{ColumnSpec, IndexSpec, TableSpec};

    fn spec() -> TableSpec {
        TableSpec::new("foos")
            .column("name", "text")
            .column_spec(ColumnSpec::new("email", "text").not_null())
    }

    #[test]
    fn current_table_ddl() {
        let sql = create_current_table(&spec());
        assert!(sql.starts_with("CREATE TABLE \"temporal\".\"foos\""));
        assert!(sql.contains("\"id\" BIGSERIAL PRIMARY KEY"));
        assert!(sql.contains("\"email\" text NOT NULL"));
    }

    #[test]
    fn history_table_ddl() {
        let sql = create_history_table("foos", "id");
        assert!(sql.contains("INHERITS (\"temporal\".\"foos\")"));
        assert!(sql.contains("\"hid\" BIGSERIAL PRIMARY KEY"));
        assert!(sql.contains("DEFAULT '9999-12-31'"));
        assert!(sql.contains("CHECK (\"valid_from\" < \"valid_to\")"));
        assert!(sql.contains("EXCLUDE USING gist"));
        assert!(sql.contains("INTERVAL '1 millisecond'"));
    }

    #[test]
    fn history_index_fillfactors() {
        let [validity, record] = history_indexes("foos", "id");
        assert!(validity.contains("(\"valid_from\", \"valid_to\") WITH (fillfactor = 100)"));
        assert!(record.contains("(\"id\") WITH (fillfactor = 90)"));
    }

    #[test]
    fn view_reads_only_current() {
        let sql = create_view("foos");
        assert_eq!(
            sql,
            "CREATE VIEW \"public\".\"foos\" AS SELECT \"foos\".* FROM ONLY \"temporal\".\"foos\""
        );
    }

    #[test]
    fn insert_rule_reads_key_from_sequence() {
        let sql = insert_rule("foos", "id", &["name".to_string()]);
        assert!(sql.contains("ON INSERT TO \"public\".\"foos\" DO INSTEAD"));
        assert!(sql.contains("currval('temporal.\"foos_id_seq\"')"));
        assert!(sql.contains("RETURNING \"id\", \"name\""));
        // Current-table insert precedes the history insert.
        let current = sql.find("INSERT INTO \"temporal\".\"foos\"").unwrap();
        let history = sql.find("INSERT INTO \"history\".\"foos\"").unwrap();
        assert!(current < history);
    }

    #[test]
    fn update_rule_closes_before_inserting() {
        let sql = update_rule("foos", "id", &["name".to_string()]);
        let close = sql.find("UPDATE \"history\".\"foos\"").unwrap();
        let insert = sql.find("INSERT INTO \"history\".\"foos\"").unwrap();
        let current = sql.find("UPDATE ONLY \"temporal\".\"foos\"").unwrap();
        assert!(close < insert && insert < current);
        assert!(sql.contains("\"valid_to\" = timezone('UTC', now())"));
        assert!(sql.contains("\"valid_to\" = '9999-12-31'"));
    }

    #[test]
    fn delete_rule_preserves_history() {
        let sql = delete_rule("foos", "id");
        let close = sql.find("UPDATE \"history\".\"foos\"").unwrap();
        let delete = sql.find("DELETE FROM ONLY \"temporal\".\"foos\"").unwrap();
        assert!(close < delete);
        assert!(!sql.contains("DELETE FROM \"history\""));
    }

    #[test]
    fn create_plan_is_ordered() {
        let plan = create_table_plan(&spec(), "id");
        assert_eq!(plan.len(), 8);
        assert!(plan[0].contains("CREATE TABLE \"temporal\".\"foos\""));
        assert!(plan[1].contains("INHERITS"));
        assert!(plan[4].contains("CREATE VIEW"));
        assert!(plan[7].contains("ON DELETE"));
    }

    #[test]
    fn rename_plan_covers_sequences_and_view() {
        let plan = rename_table_plan("foos", "bars", "id");
        assert_eq!(plan.len(), 5);
        assert!(plan[1].contains("\"foos_id_seq\" RENAME TO \"bars_id_seq\""));
        assert!(plan[3].contains("\"foos_hid_seq\" RENAME TO \"bars_hid_seq\""));
        assert!(plan[4].starts_with("ALTER VIEW"));
    }

    #[test]
    fn unique_is_stripped_for_history() {
        let index = IndexSpec::new(["email"]).unique();
        let current = create_index(TEMPORAL_SCHEMA, "foos", &index, false);
        let history = create_index(HISTORY_SCHEMA, "foos", &index, true);
        assert!(current.starts_with("CREATE UNIQUE INDEX"));
        assert!(history.starts_with("CREATE INDEX"));
        assert!(history.contains("\"history\".\"foos\""));
    }

    #[test]
    fn quoted_identifiers_throughout() {
        let sql = create_index(
            TEMPORAL_SCHEMA,
            "odd\"name",
            &IndexSpec::new(["a"]).named("idx"),
            false,
        );
        assert!(sql.contains("\"odd\"\"name\""));
    }
}
