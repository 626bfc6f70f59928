use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_feebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn feebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "request {} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

struct Ctx {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    workspace: PathBuf,
    class_id: String,
}

fn setup(prefix: &str) -> Ctx {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "name": "Class 3" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    Ctx {
        child,
        stdin,
        reader,
        workspace,
        class_id,
    }
}

fn add_head_with_amount(ctx: &mut Ctx, id_prefix: &str, name: &str, frequency: &str, amount: f64) {
    let head = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        &format!("{}-h", id_prefix),
        "feeHeads.create",
        json!({ "headName": name, "frequency": frequency }),
    );
    let head_id = head["feeHeadId"].as_str().expect("feeHeadId").to_string();
    let _ = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        &format!("{}-s", id_prefix),
        "feeStructure.save",
        json!({
            "classId": ctx.class_id,
            "feeHeadId": head_id,
            "amount": amount,
            "academicYear": "2025-2026"
        }),
    );
}

fn finish(mut ctx: Ctx) {
    drop(ctx.stdin);
    let _ = ctx.child.wait();
    let _ = std::fs::remove_dir_all(ctx.workspace);
}

#[test]
fn transport_charge_rides_along_each_month() {
    let mut ctx = setup("feebook-transport");
    add_head_with_amount(&mut ctx, "t1", "Tuition Fee", "Monthly", 1000.0);

    let point = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "tp1",
        "transport.create",
        json!({ "pickupPointName": "Gandhi Chowk", "distanceKm": 3.5, "monthlyCharge": 500 }),
    );
    let point_id = point["transportPointId"].as_str().unwrap().to_string();

    let student = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "s1",
        "students.create",
        json!({
            "studentName": "Meena Kumari",
            "classId": ctx.class_id,
            "transportOpted": true,
            "pickupPointId": point_id
        }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    // One academic month elapsed: tuition + transport.
    let dues = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "d1",
        "dues.get",
        json!({ "studentId": student_id, "asOf": "2025-04-10" }),
    );
    assert_eq!(dues["totalDue"].as_f64(), Some(1500.0));
    let lines = dues["dues"].as_array().unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines
        .iter()
        .any(|l| l["feeHead"] == "Transport Fee" && l["amount"].as_f64() == Some(500.0)));

    finish(ctx);
}

#[test]
fn opted_in_student_without_pickup_point_gets_no_transport_charge() {
    let mut ctx = setup("feebook-transport-missing");
    add_head_with_amount(&mut ctx, "t1", "Tuition Fee", "Monthly", 1000.0);

    let student = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "s1",
        "students.create",
        json!({
            "studentName": "Ravi Singh",
            "classId": ctx.class_id,
            "transportOpted": true
        }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    // Tolerated, not fatal: tuition only.
    let dues = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "d1",
        "dues.get",
        json!({ "studentId": student_id, "asOf": "2025-04-10" }),
    );
    assert_eq!(dues["totalDue"].as_f64(), Some(1000.0));
    assert!(dues["dues"]
        .as_array()
        .unwrap()
        .iter()
        .all(|l| l["feeHead"] != "Transport Fee"));

    finish(ctx);
}

#[test]
fn once_per_year_heads_are_emitted_once_not_per_month() {
    let mut ctx = setup("feebook-onetime");
    add_head_with_amount(&mut ctx, "t1", "Tuition Fee", "Monthly", 1000.0);
    add_head_with_amount(&mut ctx, "a1", "Admission Fee", "OneTime", 2500.0);

    let student = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "s1",
        "students.create",
        json!({ "studentName": "Kiran Patel", "classId": ctx.class_id }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    let dues = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "d1",
        "dues.get",
        json!({ "studentId": student_id, "asOf": "2025-08-15" }),
    );
    let admission_lines: Vec<_> = dues["dues"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|l| l["feeHead"] == "Admission Fee")
        .collect();
    assert_eq!(admission_lines.len(), 1, "one-time head emitted once");
    assert_eq!(admission_lines[0]["month"].as_str(), Some("Apr"));
    assert_eq!(dues["totalDue"].as_f64(), Some(5000.0 + 2500.0));

    finish(ctx);
}

#[test]
fn settled_one_time_head_never_returns_as_due() {
    let mut ctx = setup("feebook-onetime-settled");
    add_head_with_amount(&mut ctx, "t1", "Tuition Fee", "Monthly", 1000.0);
    add_head_with_amount(&mut ctx, "a1", "Admission Fee", "OneTime", 2500.0);

    let student = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "s1",
        "students.create",
        json!({ "studentName": "Arjun Reddy", "classId": ctx.class_id }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    // April settled in full, admission fee included.
    let pay = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "p1",
        "payment.collect",
        json!({
            "studentId": student_id,
            "selectedMonths": ["Apr"],
            "items": [
                { "head": "Tuition Fee", "month": "Apr", "amount": 1000 },
                { "head": "Admission Fee", "month": "Apr", "amount": 2500 }
            ],
            "paymentMode": "Cash",
            "amountReceived": 3500,
            "date": "2025-04-20"
        }),
    );
    assert_eq!(pay["balanceDue"].as_f64(), Some(0.0));

    // The anchor must not slide to May: only May's tuition is outstanding.
    let dues = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "d1",
        "dues.get",
        json!({ "studentId": student_id, "asOf": "2025-05-10" }),
    );
    assert_eq!(dues["totalDue"].as_f64(), Some(1000.0));
    let admission_lines: Vec<_> = dues["dues"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|l| l["feeHead"] == "Admission Fee")
        .collect();
    assert_eq!(admission_lines.len(), 1);
    assert_eq!(admission_lines[0]["month"].as_str(), Some("Apr"));
    assert_eq!(admission_lines[0]["status"].as_str(), Some("Paid"));

    finish(ctx);
}

#[test]
fn quarterly_heads_hit_quarter_start_months_only() {
    let mut ctx = setup("feebook-quarterly");
    add_head_with_amount(&mut ctx, "e1", "Exam Fee", "Quarterly", 300.0);

    let student = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "s1",
        "students.create",
        json!({ "studentName": "Sunil Yadav", "classId": ctx.class_id }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    // Apr..Aug contains two quarter starts: Apr and Jul.
    let dues = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "d1",
        "dues.get",
        json!({ "studentId": student_id, "asOf": "2025-08-15" }),
    );
    let months: Vec<&str> = dues["dues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["month"].as_str().unwrap())
        .collect();
    assert_eq!(months, vec!["Apr", "Jul"]);
    assert_eq!(dues["totalDue"].as_f64(), Some(600.0));

    finish(ctx);
}

#[test]
fn zero_amount_structure_rows_are_never_emitted() {
    let mut ctx = setup("feebook-zero");
    add_head_with_amount(&mut ctx, "t1", "Tuition Fee", "Monthly", 1000.0);
    add_head_with_amount(&mut ctx, "l1", "Lab Fee", "Monthly", 0.0);

    let student = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "s1",
        "students.create",
        json!({ "studentName": "Nisha Rao", "classId": ctx.class_id }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    let dues = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "d1",
        "dues.get",
        json!({ "studentId": student_id, "asOf": "2025-06-01" }),
    );
    assert!(dues["dues"]
        .as_array()
        .unwrap()
        .iter()
        .all(|l| l["feeHead"] != "Lab Fee"));
    assert_eq!(dues["totalDue"].as_f64(), Some(3000.0));

    finish(ctx);
}

#[test]
fn deactivated_head_drops_out_of_dues() {
    let mut ctx = setup("feebook-deactivate");
    add_head_with_amount(&mut ctx, "t1", "Tuition Fee", "Monthly", 1000.0);

    let head = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "h2",
        "feeHeads.create",
        json!({ "headName": "Computer Fee", "frequency": "Monthly" }),
    );
    let head_id = head["feeHeadId"].as_str().unwrap().to_string();
    let _ = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "fs2",
        "feeStructure.save",
        json!({
            "classId": ctx.class_id,
            "feeHeadId": head_id,
            "amount": 200,
            "academicYear": "2025-2026"
        }),
    );

    let student = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "s1",
        "students.create",
        json!({ "studentName": "Vikas Jain", "classId": ctx.class_id }),
    );
    let student_id = student["studentId"].as_str().unwrap().to_string();

    let dues = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "d1",
        "dues.get",
        json!({ "studentId": student_id, "asOf": "2025-04-10" }),
    );
    assert_eq!(dues["totalDue"].as_f64(), Some(1200.0));

    // Soft delete: the head disappears prospectively, structure row intact.
    let _ = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "h3",
        "feeHeads.deactivate",
        json!({ "feeHeadId": head_id }),
    );
    let dues = request_ok(
        &mut ctx.stdin,
        &mut ctx.reader,
        "d2",
        "dues.get",
        json!({ "studentId": student_id, "asOf": "2025-04-10" }),
    );
    assert_eq!(dues["totalDue"].as_f64(), Some(1000.0));

    finish(ctx);
}
