use std::io::Cursor;

use gridsift::Engine;
use gridsift::core::config::EngineConfig;
use gridsift::core::types::Fingerprint;
use gridsift::engine::requests::{
    FilterRequest, LoadFileOptions, SortRequest, TagRowsRequest, UpdateLabelRequest,
};
use gridsift::query::ast::{FilterExpr, FilterLeaf, FilterOperator, SortKey};
use gridsift::tags::controller::TagMode;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let csv = "name,city,amount\n\
               Alice,Oslo,120\n\
               Bob,Bergen,75\n\
               Carol,Oslo,200\n\
               Dave,Tromso,50\n";

    let dir = tempfile::tempdir()?;
    let mut engine = Engine::open(dir.path(), EngineConfig::default());

    let summary = engine.load_file(
        Cursor::new(csv),
        Fingerprint::new("demo.csv", csv.len() as u64, 1),
        LoadFileOptions::default(),
        Some(&mut |p| println!("parsed {} rows ({} bytes)", p.rows_parsed, p.bytes_parsed)),
    )?;
    println!(
        "loaded {} rows in {} ms; column types: {:?}",
        summary.rows_parsed, summary.duration_ms, summary.column_types
    );

    // Filter: city eq "Oslo".
    let response = engine.apply_filter(&FilterRequest {
        expression: FilterExpr::leaf(FilterLeaf::new("city", FilterOperator::Eq, "oslo")),
        offset: None,
        limit: None,
    })?;
    println!("{} of {} rows in Oslo", response.matched_rows, response.total_rows);

    // Sort the filtered rows by amount, highest first.
    let response = engine.apply_sorts(&SortRequest {
        sorts: vec![SortKey::desc("amount")],
        offset: None,
        limit: None,
        progressive: None,
        visible_rows: None,
    })?;
    for row in &response.rows {
        println!(
            "  {} — {}",
            row.cells[0].as_deref().unwrap_or("-"),
            row.cells[2].as_deref().unwrap_or("-")
        );
    }

    // Tag the top row and flush the annotation to the store.
    let label = engine.update_label(UpdateLabelRequest {
        id: None,
        name: "high value".to_string(),
        color: None,
        description: None,
    });
    engine.tag_rows(&TagRowsRequest {
        row_ids: vec![response.rows[0].row_id],
        label_ids: vec![label.id],
        note: Some("review this account".to_string()),
        mode: TagMode::Replace,
    })?;
    engine.persist_tags()?;

    println!("store usage: {} bytes", engine.stats().store_usage_bytes);
    Ok(())
}
