use super::ui;
use crate::core::engine::{MetalBoard, PriceEngine, Reading, Snapshot};
use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Asia::Seoul;
use comfy_table::{Cell, Color, Table};

pub async fn run(engine: &PriceEngine) -> Result<()> {
    let pb = ui::new_spinner("Fetching prices...");
    let snapshot = engine.refresh().await;
    pb.finish_and_clear();

    println!("{}", ui::style_text("Prices per don", ui::StyleType::Title));
    println!("{}", render_table(&snapshot));
    for issue in issues(&snapshot) {
        println!("{}", ui::style_text(&issue, ui::StyleType::Error));
    }
    println!(
        "{}",
        ui::style_text(
            &format!("Last updated: {}", format_time(snapshot.last_updated_at)),
            ui::StyleType::Subtle
        )
    );
    Ok(())
}

pub fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(
        || "never".to_string(),
        |at| at.with_timezone(&Seoul).format("%Y-%m-%d %H:%M KST").to_string(),
    )
}

fn sources_cell(readings: &[Option<&Reading>]) -> Cell {
    let mut names: Vec<&str> = Vec::new();
    for reading in readings.iter().flatten() {
        for source in &reading.sources {
            if !names.contains(&source.as_str()) {
                names.push(source.as_str());
            }
        }
    }
    if names.is_empty() {
        ui::na_cell(true)
    } else {
        Cell::new(names.join(", "))
    }
}

fn value_cell(reading: Option<&Reading>, format_fn: fn(f64) -> String) -> Cell {
    match reading {
        Some(r) if r.stale => Cell::new(format!("{} (stale)", format_fn(r.value))).fg(Color::Yellow),
        Some(r) => Cell::new(format_fn(r.value)),
        None => ui::na_cell(true),
    }
}

fn metal_row(table: &mut Table, label: &str, board: &MetalBoard, spot_fmt: fn(f64) -> String) {
    let spot = board.spot.as_ref();
    let per_don = board.per_don_krw.as_ref();
    table.add_row(vec![
        Cell::new(label),
        value_cell(spot, spot_fmt),
        ui::delta_cell(spot.and_then(|r| r.delta.as_ref()), spot_fmt),
        value_cell(per_don, ui::format_krw),
        ui::delta_cell(per_don.and_then(|r| r.delta.as_ref()), ui::format_krw),
        sources_cell(&[spot, per_don]),
        Cell::new(format_time(spot.map(|r| r.observed_at))),
    ]);
}

pub fn render_table(snapshot: &Snapshot) -> Table {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Item"),
        ui::header_cell("Price"),
        ui::header_cell("Change"),
        ui::header_cell("Per don (KRW)"),
        ui::header_cell("Change"),
        ui::header_cell("Source"),
        ui::header_cell("Observed"),
    ]);

    metal_row(&mut table, "Gold (USD/oz)", &snapshot.gold, ui::format_usd);
    metal_row(&mut table, "Silver (USD/oz)", &snapshot.silver, ui::format_usd);
    metal_row(
        &mut table,
        "KRX gold (KRW/g)",
        &snapshot.domestic_gold,
        ui::format_krw,
    );

    let fx = snapshot.fx.rate.as_ref();
    let fx_fmt: fn(f64) -> String = |v| ui::format_grouped(v, 2);
    table.add_row(vec![
        Cell::new("USD/KRW"),
        value_cell(fx, fx_fmt),
        ui::delta_cell(fx.and_then(|r| r.delta.as_ref()), fx_fmt),
        Cell::new(""),
        Cell::new(""),
        sources_cell(&[fx]),
        Cell::new(format_time(fx.map(|r| r.observed_at))),
    ]);
    table
}

/// Section issues, prefixed with the section they belong to.
pub fn issues(snapshot: &Snapshot) -> Vec<String> {
    [
        ("gold", &snapshot.gold.issues),
        ("silver", &snapshot.silver.issues),
        ("KRX gold", &snapshot.domestic_gold.issues),
        ("USD/KRW", &snapshot.fx.issues),
    ]
    .into_iter()
    .flat_map(|(section, list)| list.iter().map(move |issue| format!("{section}: {issue}")))
    .collect()
}
