//! Attention heat-map rendering.
use std::path::Path;

use plotters::prelude::*;

/// Renders an attention matrix (rows: decoder steps, columns: input
/// positions) as a heat-map PNG captioned with the utterance id. Both axes
/// use integer tick labels; weights are normalized to the matrix maximum
/// for contrast.
pub fn save_attention_map<P: AsRef<Path>>(
    path: P,
    att_ws: &[Vec<f32>],
    caption: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let t_dec = att_ws.len();
    let t_in = att_ws.first().map(|row| row.len()).unwrap_or(0);
    if t_dec == 0 || t_in == 0 {
        return Err("empty attention matrix".into());
    }
    let peak = att_ws
        .iter()
        .flatten()
        .fold(f32::MIN, |acc, w| acc.max(*w))
        .max(1e-8);

    let root = BitMapBackend::new(path.as_ref(), (640, 480)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption(caption, ("sans-serif", 22))
        .x_label_area_size(45)
        .y_label_area_size(45)
        .build_cartesian_2d(0i32..t_in as i32, 0i32..t_dec as i32)?;
    chart
        .configure_mesh()
        .disable_x_mesh()
        .disable_y_mesh()
        .x_desc("Input")
        .y_desc("Output")
        .draw()?;
    chart.draw_series(att_ws.iter().enumerate().flat_map(|(y, row)| {
        row.iter().enumerate().map(move |(x, w)| {
            let v = (w / peak).clamp(0., 1.);
            Rectangle::new(
                [(x as i32, y as i32), (x as i32 + 1, y as i32 + 1)],
                shade(v).filled(),
            )
        })
    }))?;
    root.present()?;
    Ok(())
}

// White at zero weight down to a dark blue at the peak.
fn shade(v: f32) -> RGBColor {
    let lerp = |a: f32, b: f32| (a + (b - a) * v) as u8;
    RGBColor(lerp(247., 8.), lerp(251., 48.), lerp(255., 107.))
}
