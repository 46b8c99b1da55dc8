use super::ui;
use crate::core::derive::{Delta, DerivedRow};
use crate::core::engine::{MetalBoard, PriceEngine};
use anyhow::Result;
use chrono_tz::Asia::Seoul;
use comfy_table::{Cell, CellAlignment, Table};

const MAX_ROWS: usize = 30;

pub async fn run(engine: &PriceEngine) -> Result<()> {
    let pb = ui::new_spinner("Fetching history...");
    let snapshot = engine.refresh().await;
    pb.finish_and_clear();

    let sections = [
        ("Gold", &snapshot.gold, ui::format_usd as fn(f64) -> String),
        ("Silver", &snapshot.silver, ui::format_usd),
        ("KRX gold", &snapshot.domestic_gold, ui::format_krw),
    ];
    for (title, board, spot_fmt) in sections {
        println!("\n{}", ui::style_text(title, ui::StyleType::Title));
        print_board(board, spot_fmt);
    }
    Ok(())
}

fn print_board(board: &MetalBoard, spot_fmt: fn(f64) -> String) {
    if board.history.is_empty() {
        let reason = board
            .issues
            .first()
            .map_or("no data", String::as_str);
        println!("{}", ui::style_text(&format!("Unavailable: {reason}"), ui::StyleType::Error));
        return;
    }
    println!("{}", render_history(&board.history, spot_fmt));
}

pub fn render_history(rows: &[DerivedRow], spot_fmt: fn(f64) -> String) -> Table {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Date"),
        ui::header_cell("Spot"),
        ui::header_cell("USD/KRW"),
        ui::header_cell("Per don (KRW)"),
        ui::header_cell("Change"),
    ]);

    let start = rows.len().saturating_sub(MAX_ROWS);
    // Newest first.
    for index in (start..rows.len()).rev() {
        let row = &rows[index];
        let delta = index
            .checked_sub(1)
            .map(|prev| Delta::between(row.don_price_krw, rows[prev].don_price_krw));
        table.add_row(vec![
            Cell::new(row.at.with_timezone(&Seoul).format("%Y-%m-%d")),
            Cell::new(spot_fmt(row.spot)).set_alignment(CellAlignment::Right),
            ui::format_optional_cell(row.fx, |fx| ui::format_grouped(fx, 2)),
            Cell::new(ui::format_krw(row.don_price_krw)).set_alignment(CellAlignment::Right),
            ui::delta_cell(delta.as_ref(), ui::format_krw),
        ]);
    }
    table
}
