use std::io::{self, BufRead, Write};

use crate::resolver::{GpuReading, NOT_FOUND_HINT};

pub const TITLE: &str = "OH MY GPU";

/// Text block printed by the console front-end.
pub fn console_report(reading: &GpuReading) -> String {
    let mut out = format!("\n{}:\n\n", TITLE);
    if reading.is_found() {
        out.push_str(&format!("GPU model:      {}\n", reading.model()));
        out.push_str(&format!("Total memory:   {}\n", reading.total_memory()));
        out.push_str(&format!("Used memory:    {}\n", reading.used_memory()));
        out.push_str(&format!("Utilization:    {}\n", reading.utilization()));
        out.push_str("\nGPU is fine.\n");
    } else {
        out.push_str(&format!("[ERROR] {}\n", reading.model()));
        out.push_str(&format!("[ERROR] {}\n", NOT_FOUND_HINT));
    }
    out
}

pub fn popup_message(reading: &GpuReading) -> String {
    if !reading.is_found() {
        return format!("{}\n{}", reading.model(), NOT_FOUND_HINT);
    }
    format!(
        "GPU model: {}\nTotal memory: {}\nUsed memory: {}\nUtilization: {}",
        reading.model(),
        reading.total_memory(),
        reading.used_memory(),
        reading.utilization()
    )
}

#[cfg(windows)]
pub fn show_popup(reading: &GpuReading) {
    let level = if reading.is_found() { rfd::MessageLevel::Info } else { rfd::MessageLevel::Warning };
    let _ = rfd::MessageDialog::new()
        .set_title(TITLE)
        .set_description(popup_message(reading))
        .set_level(level)
        .set_buttons(rfd::MessageButtons::Ok)
        .show();
}

#[cfg(not(windows))]
pub fn show_popup(reading: &GpuReading) {
    tracing::warn!("Message box is only available on Windows; printing instead");
    println!("{}\n\n{}", TITLE, popup_message(reading));
}

pub fn print_console(reading: &GpuReading) {
    print!("{}", console_report(reading));
    let _ = io::stdout().flush();
}

/// Blocks until a line (or EOF) arrives on `input`.
pub fn wait_for_enter(mut input: impl BufRead, mut output: impl Write) -> io::Result<()> {
    write!(output, "\nPress Enter, for exit...")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(())
}
