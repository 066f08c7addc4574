use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn capture(&self, actor_id: i64) -> zbus::Result<(String, Vec<u8>)>;
    async fn register_pending(
        &self,
        roll_no: &str,
        name: &str,
        class: &str,
        section: &str,
        email: &str,
    ) -> zbus::Result<(bool, String)>;
    async fn abandon_pending(&self) -> zbus::Result<bool>;
    async fn reload_gallery(&self) -> zbus::Result<u32>;
    async fn reset_session(&self) -> zbus::Result<()>;
    async fn mark_manual(&self, identity_id: i64, date: &str, status: &str, actor_id: i64) -> zbus::Result<i64>;
    async fn list_students(&self, class: &str, section: &str) -> zbus::Result<String>;
    async fn update_student(
        &self,
        id: i64,
        roll_no: &str,
        name: &str,
        class: &str,
        section: &str,
        email: &str,
    ) -> zbus::Result<bool>;
    async fn delete_student(&self, id: i64, delete_attendance: bool) -> zbus::Result<bool>;
    async fn clear_embeddings(&self) -> zbus::Result<u64>;
    async fn report(&self, filter_json: &str) -> zbus::Result<String>;
    async fn update_attendance(&self, record_id: i64, status: &str) -> zbus::Result<bool>;
    async fn delete_attendance(&self, record_id: i64) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a burst and mark everyone recognised as present
    Capture {
        /// Operator id recorded as `marked_by`
        #[arg(long, default_value_t = 0)]
        actor: i64,
        /// Write the annotated frame to this PNG file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Register the face waiting from the last capture
    Register {
        #[arg(long)]
        roll_no: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        class: String,
        #[arg(long, default_value = "")]
        section: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Discard the face waiting for registration
    Abandon,
    /// Reload known faces from the database
    Reload,
    /// Start a new sitting (forget who was marked in this session)
    Reset,
    /// Record attendance by hand
    Mark {
        /// Student id
        #[arg(long)]
        student: i64,
        /// Date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Present or Absent
        #[arg(long, default_value = "Present")]
        status: String,
        #[arg(long, default_value_t = 0)]
        actor: i64,
    },
    /// List students
    Students {
        #[arg(long, default_value = "")]
        class: String,
        #[arg(long, default_value = "")]
        section: String,
    },
    /// Edit a student's details
    UpdateStudent {
        id: i64,
        #[arg(long)]
        roll_no: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        class: String,
        #[arg(long, default_value = "")]
        section: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Remove a student
    DeleteStudent {
        id: i64,
        /// Also delete the student's attendance records
        #[arg(long)]
        with_attendance: bool,
    },
    /// Remove every stored face embedding (students are kept)
    ClearEmbeddings {
        #[arg(long)]
        yes: bool,
    },
    /// Attendance report with summary and daily counts
    Report {
        #[arg(long)]
        student: Option<i64>,
        #[arg(long)]
        roll_no: Option<String>,
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Print the raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Change the status of an attendance record
    SetStatus { record: i64, status: String },
    /// Delete an attendance record
    DeleteRecord { record: i64 },
    /// Show daemon status
    Status,
    /// List V4L2 capture devices
    Devices,
    /// Grab a burst directly from a camera (bypasses the daemon)
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 5)]
        frames: usize,
        /// Write the last frame to this PNG file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

async fn proxy() -> Result<AttendanceProxy<'static>> {
    let session_bus = std::env::var("ROLLCALL_SESSION_BUS").is_ok();
    tracing::debug!(session_bus, "connecting to rollcalld");
    let conn = if session_bus {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    AttendanceProxy::new(&conn)
        .await
        .context("connecting to rollcalld (is it running?)")
}

fn print_logs(capture: &Value) {
    let Some(logs) = capture["logs"].as_array() else {
        return;
    };
    for line in logs {
        let tag = match line["level"].as_str() {
            Some("success") => "ok",
            Some("warning") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        println!("[{tag:>5}] {}", line["message"].as_str().unwrap_or_default());
    }
}

fn report_filter(
    student: Option<i64>,
    roll_no: Option<String>,
    class: Option<String>,
    section: Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Value {
    let mut filter = serde_json::Map::new();
    if let Some(id) = student {
        filter.insert("student_id".into(), id.into());
    }
    for (key, value) in [("roll_no", roll_no), ("class", class), ("section", section)] {
        if let Some(v) = value {
            filter.insert(key.into(), v.into());
        }
    }
    for (key, date) in [("start_date", from), ("end_date", to)] {
        if let Some(d) = date {
            filter.insert(key.into(), d.format("%Y-%m-%d").to_string().into());
        }
    }
    Value::Object(filter)
}

fn print_report(report: &Value) {
    let empty = Vec::new();
    let records = report["records"].as_array().unwrap_or(&empty);
    for r in records {
        println!(
            "{:>6}  {}  {}  {:<10} {:<24} {}",
            r["id"],
            r["date"].as_str().unwrap_or_default(),
            r["time"].as_str().unwrap_or_default(),
            r["roll_no"].as_str().unwrap_or_default(),
            r["name"].as_str().unwrap_or_default(),
            r["status"].as_str().unwrap_or_default(),
        );
    }
    let s = &report["summary"];
    println!(
        "\ntotal {}  present {}  absent {}  attendance {}%",
        s["total"], s["present"], s["absent"], s["percent"]
    );
    if let Some(daily) = report["daily"].as_array() {
        for d in daily {
            println!("  {}  {} present", d["date"].as_str().unwrap_or_default(), d["present"]);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Capture { actor, out } => {
            let (json, png) = proxy().await?.capture(actor).await?;
            let capture: Value = serde_json::from_str(&json)?;
            print_logs(&capture);
            if capture["pending_registration"].as_bool() == Some(true) {
                println!("A face is waiting: run `rollcall register` or `rollcall abandon`.");
            }
            if let Some(path) = out {
                std::fs::write(&path, png).with_context(|| format!("writing {}", path.display()))?;
                println!("Annotated frame written to {}", path.display());
            }
        }
        Commands::Register {
            roll_no,
            name,
            class,
            section,
            email,
        } => {
            let (ok, message) = proxy()
                .await?
                .register_pending(&roll_no, &name, &class, &section, &email)
                .await?;
            println!("{message}");
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Abandon => {
            if proxy().await?.abandon_pending().await? {
                println!("Pending face discarded.");
            } else {
                println!("No face was waiting for registration.");
            }
        }
        Commands::Reload => {
            let n = proxy().await?.reload_gallery().await?;
            println!("Loaded {n} known faces.");
        }
        Commands::Reset => {
            proxy().await?.reset_session().await?;
            println!("Session reset.");
        }
        Commands::Mark {
            student,
            date,
            status,
            actor,
        } => {
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let id = proxy()
                .await?
                .mark_manual(student, &date.format("%Y-%m-%d").to_string(), &status, actor)
                .await?;
            println!("Recorded {status} for student {student} on {date} (record {id}).");
        }
        Commands::Students { class, section } => {
            let json = proxy().await?.list_students(&class, &section).await?;
            let students: Vec<Value> = serde_json::from_str(&json)?;
            if students.is_empty() {
                println!("No students");
            }
            for s in &students {
                println!(
                    "{:>5}  {:<10} {:<24} {:<6} {:<4} {}",
                    s["id"],
                    s["roll_no"].as_str().unwrap_or_default(),
                    s["name"].as_str().unwrap_or_default(),
                    s["class"].as_str().unwrap_or_default(),
                    s["section"].as_str().unwrap_or_default(),
                    if s["has_embedding"].as_bool() == Some(true) { "face" } else { "-" },
                );
            }
        }
        Commands::UpdateStudent {
            id,
            roll_no,
            name,
            class,
            section,
            email,
        } => {
            let updated = proxy()
                .await?
                .update_student(id, &roll_no, &name, &class, &section, &email)
                .await?;
            println!("{}", if updated { "Updated." } else { "No such student." });
        }
        Commands::DeleteStudent { id, with_attendance } => {
            let removed = proxy().await?.delete_student(id, with_attendance).await?;
            println!("{}", if removed { "Deleted." } else { "No such student." });
        }
        Commands::ClearEmbeddings { yes } => {
            if !yes {
                bail!("this removes every registered face; pass --yes to confirm");
            }
            let n = proxy().await?.clear_embeddings().await?;
            println!("Cleared {n} face embeddings.");
        }
        Commands::Report {
            student,
            roll_no,
            class,
            section,
            from,
            to,
            json,
        } => {
            let filter = report_filter(student, roll_no, class, section, from, to);
            let raw = proxy().await?.report(&filter.to_string()).await?;
            if json {
                println!("{raw}");
            } else {
                print_report(&serde_json::from_str(&raw)?);
            }
        }
        Commands::SetStatus { record, status } => {
            let updated = proxy().await?.update_attendance(record, &status).await?;
            println!("{}", if updated { "Updated." } else { "No such record." });
        }
        Commands::DeleteRecord { record } => {
            let removed = proxy().await?.delete_attendance(record).await?;
            println!("{}", if removed { "Deleted." } else { "No such record." });
        }
        Commands::Status => {
            let json = proxy().await?.status().await?;
            let status: Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Devices => {
            let devices = rollcall_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found.");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test { device, frames, out } => {
            println!("Running camera diagnostics on {device}...");
            let camera = rollcall_hw::Camera::open(&device, 640, 480)?;
            println!(
                "Negotiated {}x{} {:?}",
                camera.width,
                camera.height,
                camera.pixel_format()
            );
            let (burst, dark) = camera.capture_burst(frames, Duration::from_millis(150), 4)?;
            for f in &burst {
                println!("  seq {:>5}  brightness {:>6.1}", f.sequence, f.avg_brightness());
            }
            println!("{} frames kept, {dark} dark frames skipped", burst.len());
            if let (Some(path), Some(last)) = (out, burst.last()) {
                last.image
                    .save(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Last frame written to {}", path.display());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_filter_only_sets_given_fields() {
        let from = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
        let filter = report_filter(None, None, Some("10".into()), None, Some(from), None);
        assert_eq!(filter, serde_json::json!({"class": "10", "start_date": "2024-09-01"}));
    }

    #[test]
    fn test_cli_parses_capture() {
        let cli = Cli::try_parse_from(["rollcall", "capture", "--actor", "4", "--out", "frame.png"]).unwrap();
        match cli.command {
            Commands::Capture { actor, out } => {
                assert_eq!(actor, 4);
                assert_eq!(out, Some(PathBuf::from("frame.png")));
            }
            _ => panic!("expected capture"),
        }
    }
}
