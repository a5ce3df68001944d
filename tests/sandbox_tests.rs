use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use judge::language::LanguageSpec;
use judge::sandbox::{Environment, EnvironmentProvider, Judge, RunLimits, SimpleProvider};
use judge::submission::{Limits, TestCase, Verdict};

const SUM: &str = "read a b\necho $((a + b))\n";

fn shell() -> LanguageSpec {
    LanguageSpec::new("sh", "main.sh", Some("sh -n %SOURCE%"), "sh %SOURCE%")
}

fn cases() -> Vec<TestCase> {
    vec![
        TestCase {
            order_index: 0,
            input: "3 4\n".to_string(),
            expected_output: "7\n".to_string(),
            is_sample: true,
        },
        TestCase {
            order_index: 1,
            input: "20 22".to_string(),
            expected_output: "42".to_string(),
            is_sample: false,
        },
    ]
}

fn limits(time_limit_ms: u64) -> Limits {
    Limits {
        time_limit_ms,
        memory_limit_mb: None,
    }
}

fn judge_in(root: &TempDir, command_timeout: Duration) -> Judge<SimpleProvider> {
    let provider = SimpleProvider::build(Some(root.path().to_path_buf()), command_timeout).unwrap();
    Judge::new(provider)
}

fn leftover_environments(root: &TempDir) -> usize {
    std::fs::read_dir(root.path()).unwrap().count()
}

#[tokio::test]
async fn shell_sum_is_accepted() {
    let root = TempDir::new().unwrap();
    let judge = judge_in(&root, Duration::from_secs(10));

    let judgement = judge.judge(SUM, &shell(), &cases(), &limits(2000)).await;

    assert_eq!(judgement.verdict, Verdict::Accepted);
    assert_eq!(judgement.diagnostic, None);
    assert_eq!(leftover_environments(&root), 0);
}

#[tokio::test]
async fn wrong_answer() {
    let root = TempDir::new().unwrap();
    let judge = judge_in(&root, Duration::from_secs(10));

    let judgement = judge
        .judge("echo 4\n", &shell(), &cases(), &limits(2000))
        .await;

    assert_eq!(judgement.verdict, Verdict::WrongAnswer);
    assert_eq!(judgement.diagnostic, None);
}

#[tokio::test]
async fn infinite_loop_is_killed_at_the_limit() {
    let root = TempDir::new().unwrap();
    let judge = judge_in(&root, Duration::from_secs(10));

    let started = Instant::now();
    let judgement = judge
        .judge(
            "sleep 30 &\nwhile :; do :; done\n",
            &shell(),
            &cases(),
            &limits(1000),
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(judgement.verdict, Verdict::TimeLimitExceeded);
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    assert_eq!(leftover_environments(&root), 0);
}

#[tokio::test]
async fn syntax_error_is_compile_error() {
    let root = TempDir::new().unwrap();
    let judge = judge_in(&root, Duration::from_secs(10));

    let judgement = judge
        .judge("if then fi\n", &shell(), &cases(), &limits(2000))
        .await;

    assert_eq!(judgement.verdict, Verdict::CompileError);
    assert!(!judgement.diagnostic.unwrap().trim().is_empty());
}

#[tokio::test]
async fn slow_compiler_times_out() {
    let root = TempDir::new().unwrap();
    let judge = judge_in(&root, Duration::from_secs(1));
    let language = LanguageSpec::new("slow", "main.sh", Some("sleep 10"), "sh main.sh");

    let judgement = judge.judge(SUM, &language, &cases(), &limits(2000)).await;

    assert_eq!(judgement.verdict, Verdict::CompileError);
    assert_eq!(judgement.diagnostic.as_deref(), Some("Compilation timed out"));
}

#[tokio::test]
async fn non_zero_exit_is_runtime_error() {
    let root = TempDir::new().unwrap();
    let judge = judge_in(&root, Duration::from_secs(10));

    let judgement = judge
        .judge("echo oops >&2\nexit 3\n", &shell(), &cases(), &limits(2000))
        .await;
    assert_eq!(judgement.verdict, Verdict::RuntimeError);
    assert_eq!(judgement.diagnostic.as_deref(), Some("oops\n"));

    let judgement = judge
        .judge("exit 3\n", &shell(), &cases(), &limits(2000))
        .await;
    assert_eq!(
        judgement.diagnostic.as_deref(),
        Some("Process exited with code 3")
    );
}

#[tokio::test]
async fn environments_are_independent() {
    let root = TempDir::new().unwrap();
    let provider = SimpleProvider::build(Some(root.path().to_path_buf()), Duration::from_secs(5))
        .unwrap();

    let mut first = provider.create().await.unwrap();
    let mut second = provider.create().await.unwrap();
    first.write_file("secret.txt", "first").await.unwrap();

    let output = second
        .run("cat secret.txt", &RunLimits::default())
        .await
        .unwrap();
    assert_ne!(output.exit_code, Some(0));

    let output = first
        .run("cat secret.txt", &RunLimits::default())
        .await
        .unwrap();
    assert_eq!(output.stdout, "first");

    assert!(first.write_file("../escape.txt", "x").await.is_err());

    provider.destroy(first).await.unwrap();
    provider.destroy(second).await.unwrap();
    assert_eq!(leftover_environments(&root), 0);
}
