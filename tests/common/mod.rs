use std::path::Path;
use strata::types::{Field, FieldType};
use strata::{Engine, EngineConfig, TableId, Tuple, TupleDesc};

/// Opens an engine over `dir` and registers the standard two-column test
/// table. Reopening over the same directory yields the same table id, so
/// a second call simulates a post-crash restart.
pub fn open_engine(dir: &Path, pool_capacity: usize) -> (Engine, TableId) {
    let engine = Engine::open(EngineConfig::new(dir).pool_capacity(pool_capacity)).unwrap();
    let desc = TupleDesc::new(
        vec![FieldType::Int, FieldType::Int],
        vec![Some("id".into()), Some("balance".into())],
    );
    let table = engine.create_table("accounts", desc).unwrap();
    (engine, table)
}

pub fn row(engine: &Engine, table: TableId, id: i32, balance: i32) -> Tuple {
    let mut t = Tuple::new(engine.catalog().tuple_desc(table).unwrap());
    t.set_field(0, Field::Int(id)).unwrap();
    t.set_field(1, Field::Int(balance)).unwrap();
    t
}

/// Reads every record of the table under a fresh transaction, committed
/// before returning, and yields (id, balance) pairs sorted by id.
pub fn read_all(engine: &Engine, table: TableId) -> Vec<(i32, i32)> {
    let tid = engine.begin().unwrap();
    let file = engine.catalog().table_file(table).unwrap();
    let mut rows: Vec<(i32, i32)> = file
        .scan(tid, engine.pool().as_ref())
        .map(|t| {
            let t = t.unwrap();
            match (t.field(0), t.field(1)) {
                (Field::Int(a), Field::Int(b)) => (*a, *b),
                _ => panic!("unexpected field types"),
            }
        })
        .collect();
    engine.commit(tid).unwrap();
    rows.sort_unstable();
    rows
}
