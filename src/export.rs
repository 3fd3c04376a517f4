//! Bulk batch → formatted XLSX workbook.
//!
//! Fixed columns, conditional fills on the recommendation and liquidity
//! cells, and a trailing summary of counts by recommendation. Error rows
//! carry their message instead of valuation figures.

use rust_xlsxwriter::{Color, Format, Workbook, Worksheet};

use crate::error::Result;
use crate::types::{BulkRow, BulkRowStatus, LiquidityClass, Recommendation};

const HEADERS: &[&str] = &[
    "Brand",
    "Model",
    "Fuel",
    "Mileage (km)",
    "Build year",
    "APR",
    "ETR (days)",
    "Index price",
    "Advised selling price",
    "Advised purchase price",
    "Recommendation",
    "Liquidity",
    "Search link",
];

// Classic spreadsheet traffic-light fills.
const GREEN_BG: u32 = 0xC6EFCE;
const GREEN_FG: u32 = 0x006100;
const AMBER_BG: u32 = 0xFFEB9C;
const AMBER_FG: u32 = 0x9C6500;
const RED_BG: u32 = 0xFFC7CE;
const RED_FG: u32 = 0x9C0006;

fn fill(bg: u32, fg: u32) -> Format {
    Format::new()
        .set_background_color(Color::RGB(bg))
        .set_font_color(Color::RGB(fg))
}

fn recommendation_format(rec: Recommendation) -> Format {
    match rec {
        Recommendation::Buy => fill(GREEN_BG, GREEN_FG),
        Recommendation::NoBuy => fill(RED_BG, RED_FG),
        Recommendation::Uncertain => fill(AMBER_BG, AMBER_FG),
    }
}

fn liquidity_format(liquidity: LiquidityClass) -> Option<Format> {
    match liquidity {
        LiquidityClass::High => Some(fill(GREEN_BG, GREEN_FG)),
        LiquidityClass::Medium => Some(fill(AMBER_BG, AMBER_FG)),
        LiquidityClass::Low => Some(fill(RED_BG, RED_FG)),
        LiquidityClass::Unknown => None,
    }
}

/// Render the batch to XLSX bytes.
pub fn export_batch(rows: &[BulkRow]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Valuations")?;

    let header = Format::new().set_bold();
    for (col, title) in HEADERS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *title, &header)?;
    }
    for (col, width) in [18, 20, 12, 12, 10, 8, 10, 12, 18, 20, 16, 10, 40]
        .iter()
        .enumerate()
    {
        worksheet.set_column_width(col as u16, *width as f64)?;
    }

    let mut buy = 0usize;
    let mut no_buy = 0usize;
    let mut uncertain = 0usize;
    let mut errors = 0usize;

    let mut row_idx: u32 = 1;
    for row in rows {
        match (&row.status, &row.report) {
            (BulkRowStatus::Completed, Some(report)) => {
                match report.advice.recommendation {
                    Recommendation::Buy => buy += 1,
                    Recommendation::NoBuy => no_buy += 1,
                    Recommendation::Uncertain => uncertain += 1,
                }
                write_completed_row(worksheet, row_idx, report)?;
            }
            _ => {
                errors += 1;
                write_error_row(worksheet, row_idx, row)?;
            }
        }
        row_idx += 1;
    }

    // Trailing summary of counts by recommendation.
    row_idx += 1;
    let bold = Format::new().set_bold();
    worksheet.write_string_with_format(row_idx, 0, "Summary", &bold)?;
    for (label, count, format) in [
        ("buy", buy, Some(fill(GREEN_BG, GREEN_FG))),
        ("no-buy", no_buy, Some(fill(RED_BG, RED_FG))),
        ("uncertain", uncertain, Some(fill(AMBER_BG, AMBER_FG))),
        ("errors", errors, None),
    ] {
        row_idx += 1;
        match format {
            Some(f) => worksheet.write_string_with_format(row_idx, 0, label, &f)?,
            None => worksheet.write_string(row_idx, 0, label)?,
        };
        worksheet.write_number(row_idx, 1, count as f64)?;
    }

    Ok(workbook.save_to_buffer()?)
}

fn write_completed_row(
    worksheet: &mut Worksheet,
    row_idx: u32,
    report: &crate::types::ValuationReport,
) -> Result<()> {
    let attrs = &report.attributes;
    worksheet.write_string(row_idx, 0, &attrs.brand)?;
    worksheet.write_string(row_idx, 1, &attrs.model)?;
    if let Some(fuel) = &attrs.fuel_type {
        worksheet.write_string(row_idx, 2, fuel)?;
    }
    if attrs.mileage_km > 0 {
        worksheet.write_number(row_idx, 3, attrs.mileage_km as f64)?;
    }
    if let Some(year) = attrs.build_year {
        worksheet.write_number(row_idx, 4, year as f64)?;
    }

    let liquidity = match &report.index {
        Some(index) => {
            if let Some(apr) = index.apr {
                worksheet.write_number(row_idx, 5, apr)?;
            }
            if let Some(etr) = index.etr_days {
                worksheet.write_number(row_idx, 6, etr as f64)?;
            }
            worksheet.write_number(row_idx, 7, index.total_value)?;
            index.liquidity
        }
        None => LiquidityClass::Unknown,
    };

    if let Some(price) = report.advice.recommended_selling_price {
        worksheet.write_number(row_idx, 8, price)?;
    }
    if let Some(price) = report.advice.recommended_purchase_price {
        worksheet.write_number(row_idx, 9, price)?;
    }

    let rec = report.advice.recommendation;
    worksheet.write_string_with_format(
        row_idx,
        10,
        rec.to_string(),
        &recommendation_format(rec),
    )?;

    match liquidity_format(liquidity) {
        Some(f) => worksheet.write_string_with_format(row_idx, 11, liquidity.to_string(), &f)?,
        None => worksheet.write_string(row_idx, 11, liquidity.to_string())?,
    };

    if let Some(url) = &report.search_url {
        worksheet.write_string(row_idx, 12, url)?;
    }
    Ok(())
}

fn write_error_row(worksheet: &mut Worksheet, row_idx: u32, row: &BulkRow) -> Result<()> {
    if let Some(parsed) = &row.parsed {
        worksheet.write_string(row_idx, 0, &parsed.attributes.brand)?;
        worksheet.write_string(row_idx, 1, &parsed.attributes.model)?;
    } else {
        worksheet.write_string(row_idx, 0, &row.raw_description)?;
    }
    let message = row.error.as_deref().unwrap_or("not processed");
    worksheet.write_string_with_format(
        row_idx,
        10,
        format!("error: {message}"),
        &fill(RED_BG, RED_FG),
    )?;
    Ok(())
}
