use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Args, Parser, Subcommand};
use facetrack_hw::{CameraDevice, CameraStream, SyntheticCamera};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.facetrack.Attendance1",
    default_service = "org.facetrack.Attendance1",
    default_path = "/org/facetrack/Attendance1"
)]
trait Attendance {
    async fn add_employee(&self, employee: &str) -> zbus::Result<String>;
    async fn update_employee(&self, id: u32, update: &str) -> zbus::Result<String>;
    async fn remove_employee(&self, id: u32) -> zbus::Result<bool>;
    async fn get_employee(&self, id: u32) -> zbus::Result<String>;
    async fn list_employees(&self, search: &str) -> zbus::Result<String>;
    async fn enroll(&self, id: u32, prompts: &str) -> zbus::Result<String>;
    async fn cancel_enrollment(&self) -> zbus::Result<bool>;
    async fn enrollment_progress(&self) -> zbus::Result<String>;
    async fn recognize(&self) -> zbus::Result<String>;
    async fn punch(&self, id: u32, kind: &str) -> zbus::Result<String>;
    async fn check_in(&self, kind: &str) -> zbus::Result<String>;
    async fn record_manual(&self, entry: &str) -> zbus::Result<String>;
    async fn daily_overview(&self, date: &str) -> zbus::Result<String>;
    async fn attendance(&self) -> zbus::Result<String>;
    async fn employee_attendance(&self, id: u32) -> zbus::Result<String>;
    async fn monthly_summary(&self, id: u32, year: i32, month: u32) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facetrack", about = "FaceTrack attendance CLI")]
struct Cli {
    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run camera diagnostics
    Test(TestArgs),
    #[command(flatten)]
    Daemon(DaemonCommand),
}

/// Commands answered by facetrackd over D-Bus.
#[derive(Subcommand)]
enum DaemonCommand {
    /// Manage employees
    #[command(subcommand)]
    Employee(EmployeeCommand),
    /// Capture face samples for an employee
    Enroll {
        /// Employee id
        id: u32,
        /// Custom prompt (repeatable); defaults to the daemon's list
        #[arg(short, long = "prompt")]
        prompts: Vec<String>,
    },
    /// Cancel the running enrollment
    Cancel,
    /// Show enrollment progress
    Progress {
        /// Keep polling until the enrollment ends
        #[arg(short, long)]
        watch: bool,
    },
    /// Identify the person in front of the camera without punching
    Recognize,
    /// Record a punch for an employee, now or by hand for a given time
    Punch {
        id: u32,
        /// "in" or "out"; alternates automatically when omitted
        #[arg(short, long, conflicts_with = "at")]
        kind: Option<String>,
        /// Manual check-in time, "YYYY-MM-DD HH:MM"
        #[arg(long, value_parser = parse_at)]
        at: Option<NaiveDateTime>,
        /// Manual check-out time on the same day, "HH:MM"
        #[arg(long, value_parser = parse_clock, requires = "at")]
        out_at: Option<NaiveTime>,
        /// "present" or "late"; derived from the check-in time when omitted
        #[arg(long, requires = "at")]
        status: Option<String>,
    },
    /// Recognize and punch in one step
    CheckIn {
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// List attendance records, newest first
    Attendance {
        /// Only this employee
        #[arg(short, long)]
        employee: Option<u32>,
    },
    /// Present, late and absent counts for a day
    Today {
        /// "YYYY-MM-DD"; defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Monthly attendance summary
    Summary {
        id: u32,
        /// Defaults to the current year
        #[arg(long)]
        year: Option<i32>,
        /// Defaults to the current month
        #[arg(long)]
        month: Option<u32>,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum EmployeeCommand {
    /// Add an employee
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        department: String,
        #[arg(long, default_value = "")]
        position: String,
        /// Explicit id; the next free id is used otherwise
        #[arg(long)]
        id: Option<u32>,
    },
    /// List employees
    List {
        /// Filter by name, email, department or position
        #[arg(short, long)]
        search: Option<String>,
    },
    /// Show one employee and their enrollment
    Show { id: u32 },
    /// Change employee fields
    Update {
        id: u32,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        position: Option<String>,
        /// "active" or "inactive"
        #[arg(long)]
        status: Option<String>,
    },
    /// Remove an employee and their enrollment
    Remove { id: u32 },
}

#[derive(Args)]
struct TestArgs {
    /// "synthetic" or a V4L2 device path
    #[arg(short, long, default_value = "synthetic")]
    device: String,
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,
    /// Frames to capture
    #[arg(short, long, default_value_t = 10)]
    frames: usize,
    /// Write one encoded sample to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let command = match cli.command {
        Commands::Test(args) => return run_camera_test(&args),
        Commands::Daemon(command) => command,
    };

    // Enrollment runs for over a minute with the default timings.
    let conn = zbus::connection::Builder::session()?
        .method_timeout(Duration::from_secs(600))
        .build()
        .await
        .context("cannot connect to the session bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("facetrackd is not running")?;
    let raw = cli.json;

    match command {
        DaemonCommand::Employee(cmd) => run_employee(&proxy, cmd, raw).await?,
        DaemonCommand::Enroll { id, prompts } => {
            let prompts = if prompts.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&prompts)?
            };
            println!("Enrolling employee {id}. Follow the prompts (see `facetrack progress --watch`).");
            let report = parse(&proxy.enroll(id, &prompts).await?)?;
            if raw {
                print_json(&report);
            } else {
                println!("Stored {} samples for employee {id}", report["samples"]);
                match (&report["remote"], &report["remote_error"]) {
                    (Value::String(msg), _) => println!("Recognition service: {msg}"),
                    (_, Value::String(err)) => println!("Recognition service not updated: {err}"),
                    _ => {}
                }
            }
        }
        DaemonCommand::Cancel => {
            if proxy.cancel_enrollment().await? {
                println!("Enrollment cancelled");
            } else {
                println!("No enrollment running");
            }
        }
        DaemonCommand::Progress { watch } => loop {
            let progress = parse(&proxy.enrollment_progress().await?)?;
            if raw {
                print_json(&progress);
            } else {
                print_progress(&progress);
            }
            let running = matches!(
                progress["state"]["state"].as_str(),
                Some("awaiting_prompt" | "capturing")
            );
            if !watch || !running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        },
        DaemonCommand::Recognize => {
            let outcome = parse(&proxy.recognize().await?)?;
            if raw {
                print_json(&outcome);
            } else {
                println!("{}", describe_outcome(&outcome));
            }
        }
        DaemonCommand::Punch {
            id,
            kind,
            at: None,
            ..
        } => {
            let punch = parse(&proxy.punch(id, kind.as_deref().unwrap_or("")).await?)?;
            if raw {
                print_json(&punch);
            } else {
                print_punch(&punch);
            }
        }
        DaemonCommand::Punch {
            id,
            at: Some(at),
            out_at,
            status,
            ..
        } => {
            let entry = manual_entry(id, at, out_at, status.as_deref());
            let punches = parse(&proxy.record_manual(&entry.to_string()).await?)?;
            if raw {
                print_json(&punches);
            } else {
                for punch in punches.as_array().into_iter().flatten() {
                    print_punch(punch);
                }
            }
        }
        DaemonCommand::CheckIn { kind } => {
            let report = parse(&proxy.check_in(kind.as_deref().unwrap_or("")).await?)?;
            if raw {
                print_json(&report);
            } else {
                println!("{}", describe_outcome(&report["outcome"]));
                if report["punch"].is_object() {
                    print_punch(&report["punch"]);
                } else if let Some(err) = report["punch_error"].as_str() {
                    println!("No punch recorded: {err}");
                }
            }
        }
        DaemonCommand::Attendance { employee } => {
            let records = match employee {
                Some(id) => proxy.employee_attendance(id).await?,
                None => proxy.attendance().await?,
            };
            let records = parse(&records)?;
            if raw {
                print_json(&records);
            } else {
                let records = records.as_array().cloned().unwrap_or_default();
                if records.is_empty() {
                    println!("No attendance records");
                }
                for punch in &records {
                    print_punch(punch);
                }
            }
        }
        DaemonCommand::Today { date } => {
            let date = date.map(|d| d.to_string()).unwrap_or_default();
            let overview = parse(&proxy.daily_overview(&date).await?)?;
            if raw {
                print_json(&overview);
            } else {
                println!(
                    "{}: present {}  late {}  absent {}  of {} employees",
                    str_field(&overview, "date"),
                    overview["present"],
                    overview["late"],
                    overview["absent"],
                    overview["total"]
                );
            }
        }
        DaemonCommand::Summary { id, year, month } => {
            let today = chrono::Local::now().date_naive();
            let year = year.unwrap_or(today.year());
            let month = month.unwrap_or(today.month());
            let summary = parse(&proxy.monthly_summary(id, year, month).await?)?;
            if raw {
                print_json(&summary);
            } else {
                println!("Employee {id}, {year}-{month:02}");
                println!(
                    "  present {}  late {}  absent {}  working days {}",
                    summary["present"], summary["late"], summary["absent"], summary["total_working_days"]
                );
                for week in summary["weeks"].as_array().into_iter().flatten() {
                    println!(
                        "  week {}: on time {}, late {}, absent {}",
                        week["week"], week["on_time"], week["late"], week["absent"]
                    );
                }
            }
        }
        DaemonCommand::Status => {
            let status = parse(&proxy.status().await?)?;
            print_json(&status);
        }
    }

    Ok(())
}

async fn run_employee(proxy: &AttendanceProxy<'_>, cmd: EmployeeCommand, raw: bool) -> Result<()> {
    match cmd {
        EmployeeCommand::Add {
            name,
            email,
            department,
            position,
            id,
        } => {
            let body = json!({
                "id": id,
                "name": name,
                "email": email,
                "department": department,
                "position": position,
            });
            let employee = parse(&proxy.add_employee(&body.to_string()).await?)?;
            if raw {
                print_json(&employee);
            } else {
                println!("Added employee {}: {}", employee["id"], str_field(&employee, "name"));
            }
        }
        EmployeeCommand::List { search } => {
            let list = parse(&proxy.list_employees(search.as_deref().unwrap_or("")).await?)?;
            if raw {
                print_json(&list);
            } else {
                let list = list.as_array().cloned().unwrap_or_default();
                if list.is_empty() {
                    println!("No employees");
                }
                for e in &list {
                    println!(
                        "{:>4}  {:<24} {:<28} {:<16} {:<16} {}",
                        e["id"],
                        str_field(e, "name"),
                        str_field(e, "email"),
                        str_field(e, "department"),
                        str_field(e, "position"),
                        str_field(e, "status"),
                    );
                }
            }
        }
        EmployeeCommand::Show { id } => {
            let details = parse(&proxy.get_employee(id).await?)?;
            print_json(&details);
        }
        EmployeeCommand::Update {
            id,
            name,
            email,
            department,
            position,
            status,
        } => {
            let mut update = Map::new();
            for (key, value) in [
                ("name", name),
                ("email", email),
                ("department", department),
                ("position", position),
                ("status", status),
            ] {
                if let Some(value) = value {
                    update.insert(key.to_string(), Value::String(value));
                }
            }
            let employee = parse(&proxy.update_employee(id, &Value::Object(update).to_string()).await?)?;
            if raw {
                print_json(&employee);
            } else {
                println!("Updated employee {id}");
            }
        }
        EmployeeCommand::Remove { id } => {
            proxy.remove_employee(id).await?;
            println!("Removed employee {id}");
        }
    }
    Ok(())
}

/// Open the camera directly, bypassing the daemon.
fn run_camera_test(args: &TestArgs) -> Result<()> {
    println!("Running camera diagnostics on {}...", args.device);

    let mut camera: Box<dyn CameraDevice> = if args.device == "synthetic" {
        Box::new(SyntheticCamera::new(args.width, args.height))
    } else {
        open_hw_camera(args)?
    };

    let mut stream = CameraStream::open(camera.as_mut())?;
    let mut usable = 0;
    let mut sample = None;
    for i in 0..args.frames {
        match stream.capture_frame() {
            Ok(frame) => {
                let dark = frame.is_dark();
                println!(
                    "frame {i:>3}: {}x{} brightness {:>6.1}{}",
                    frame.width,
                    frame.height,
                    frame.avg_brightness(),
                    if dark { "  (dark)" } else { "" }
                );
                if !dark && frame.validate().is_ok() {
                    usable += 1;
                    if sample.is_none() {
                        sample = Some(frame.encode_sample()?);
                    }
                }
            }
            Err(e) => println!("frame {i:>3}: capture failed: {e}"),
        }
    }
    stream.release();

    println!("{usable}/{} frames usable", args.frames);
    if let (Some(path), Some(jpeg)) = (&args.output, &sample) {
        std::fs::write(path, jpeg).with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {} byte sample to {}", jpeg.len(), path.display());
    }
    if usable == 0 {
        anyhow::bail!("no usable frames captured");
    }
    Ok(())
}

#[cfg(feature = "v4l2")]
fn open_hw_camera(args: &TestArgs) -> Result<Box<dyn CameraDevice>> {
    for dev in facetrack_hw::v4l_camera::V4lCamera::list_devices() {
        println!("found {} ({}, {})", dev.path, dev.name, dev.driver);
    }
    Ok(Box::new(facetrack_hw::V4lCamera::new(&args.device, args.width, args.height)))
}

#[cfg(not(feature = "v4l2"))]
fn open_hw_camera(args: &TestArgs) -> Result<Box<dyn CameraDevice>> {
    anyhow::bail!(
        "{} needs V4L2 support; rebuild with --features v4l2 or use --device synthetic",
        args.device
    )
}

fn parse_at(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M")
        .map_err(|e| format!("expected \"YYYY-MM-DD HH:MM\": {e}"))
}

fn parse_clock(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| format!("expected \"HH:MM\": {e}"))
}

/// JSON body for `record_manual`.
fn manual_entry(id: u32, at: NaiveDateTime, out_at: Option<NaiveTime>, status: Option<&str>) -> Value {
    json!({
        "employeeId": id,
        "date": at.date(),
        "checkIn": at.time(),
        "checkOut": out_at,
        "status": status.map(str::to_ascii_lowercase),
    })
}

fn parse(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("daemon returned invalid JSON")
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("")
}

fn print_progress(progress: &Value) {
    let state = progress["state"]["state"].as_str().unwrap_or("unknown");
    print!(
        "{state}: {}/{} ({}%)",
        progress["captured"], progress["total"], progress["percent"]
    );
    if let Some(prompt) = progress["prompt"].as_str() {
        print!("  prompt: {prompt}");
    }
    if let Some(warning) = progress["warning"].as_str() {
        print!("  warning: {warning}");
    }
    println!();
}

fn print_punch(punch: &Value) {
    println!(
        "{}  {:<4} {:<8} {} ({})",
        str_field(punch, "timestamp"),
        str_field(punch, "kind"),
        str_field(punch, "status"),
        str_field(punch, "employee_name"),
        punch["employee_id"],
    );
}

fn describe_outcome(outcome: &Value) -> String {
    match outcome["outcome"].as_str() {
        Some("matched") => {
            let confidence = outcome["confidence"]
                .as_f64()
                .map(|c| format!(" (confidence {:.0}%)", c * 100.0))
                .unwrap_or_default();
            format!(
                "Recognized {} (employee {}){confidence}",
                str_field(outcome, "name"),
                outcome["employee_id"]
            )
        }
        Some("not_matched") => "No enrolled employee recognized".to_string(),
        Some("service_unavailable") => format!(
            "Recognition service unavailable: {}",
            str_field(outcome, "reason")
        ),
        _ => outcome.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_outcome() {
        let matched = json!({"outcome": "matched", "employee_id": 7, "name": "Ana", "confidence": 0.91});
        assert_eq!(describe_outcome(&matched), "Recognized Ana (employee 7) (confidence 91%)");
        let placeholder = json!({"outcome": "matched", "employee_id": 7, "name": "Ana", "confidence": null});
        assert_eq!(describe_outcome(&placeholder), "Recognized Ana (employee 7)");
        assert_eq!(
            describe_outcome(&json!({"outcome": "not_matched"})),
            "No enrolled employee recognized"
        );
        assert!(describe_outcome(&json!({"outcome": "service_unavailable", "reason": "down"}))
            .ends_with("down"));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["facetrack", "enroll", "7", "-p", "center", "-p", "left"]).unwrap();
        match cli.command {
            Commands::Daemon(DaemonCommand::Enroll { id, prompts }) => {
                assert_eq!(id, 7);
                assert_eq!(prompts, vec!["center", "left"]);
            }
            _ => panic!("expected enroll"),
        }
        let cli = Cli::try_parse_from(["facetrack", "--json", "employee", "list", "-s", "eng"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Daemon(DaemonCommand::Employee(EmployeeCommand::List { search: Some(_) }))
        ));
        assert!(Cli::try_parse_from(["facetrack", "check-in", "--kind", "out"]).is_ok());
        assert!(matches!(
            Cli::try_parse_from(["facetrack", "test", "--frames", "3"]).unwrap().command,
            Commands::Test(TestArgs { frames: 3, .. })
        ));
    }

    #[test]
    fn test_camera_diagnostics_on_synthetic() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("sample.jpg");
        let args = TestArgs {
            device: "synthetic".into(),
            width: 64,
            height: 48,
            frames: 3,
            output: Some(out.clone()),
        };
        run_camera_test(&args).unwrap();
        let jpeg = std::fs::read(&out).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_manual_punch_arguments() {
        let cli = Cli::try_parse_from([
            "facetrack", "punch", "7", "--at", "2025-05-02 09:20", "--out-at", "17:00", "--status", "Late",
        ])
        .unwrap();
        let Commands::Daemon(DaemonCommand::Punch {
            id,
            kind: None,
            at: Some(at),
            out_at,
            status,
        }) = cli.command
        else {
            panic!("expected a manual punch");
        };
        let entry = manual_entry(id, at, out_at, status.as_deref());
        assert_eq!(
            entry,
            json!({
                "employeeId": 7,
                "date": "2025-05-02",
                "checkIn": "09:20:00",
                "checkOut": "17:00:00",
                "status": "late",
            })
        );

        assert!(Cli::try_parse_from(["facetrack", "punch", "7", "--at", "09:20"]).is_err());
        assert!(Cli::try_parse_from(["facetrack", "punch", "7", "--out-at", "17:00"]).is_err());
        assert!(Cli::try_parse_from(["facetrack", "punch", "7", "--kind", "in", "--at", "2025-05-02 09:20"]).is_err());
        assert!(matches!(
            Cli::try_parse_from(["facetrack", "today", "--date", "2025-05-02"]).unwrap().command,
            Commands::Daemon(DaemonCommand::Today { date: Some(_) })
        ));
    }
}
