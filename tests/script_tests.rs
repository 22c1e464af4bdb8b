//! Integration tests for the script executor.
//!
//! These run scripts end-to-end over a pool backed by the in-process
//! mock engine, including loading script bodies from files on disk.

use std::io::Write;
use std::sync::Arc;

use reservoir::engine::mock::MockConnector;
use reservoir::prelude::*;

async fn pool_with(connector: &MockConnector) -> ConnectionPool {
    ConnectionPool::open(
        PoolConfig::single_server(ServerConfig::new("localhost")),
        Arc::new(connector.clone()),
    )
    .await
}

// Engine behaviour for the summary script used throughout this suite.
fn summary_connector() -> MockConnector {
    MockConnector::new().with_handler(|script, vars| {
        if !script.contains("summary") {
            return Ok(());
        }
        let samples = vars
            .get("samples")
            .and_then(RValue::as_nums)
            .ok_or_else(|| Error::Eval("object 'samples' not found".to_string()))?;
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        vars.insert("n".to_string(), RValue::Num(n));
        vars.insert("mean".to_string(), RValue::Num(mean));
        vars.insert("summary".to_string(), RValue::Nums(vec![n, mean]));
        Ok(())
    })
}

#[tokio::test]
async fn test_script_round_trip() {
    let connector = summary_connector();
    let pool = pool_with(&connector).await;

    let mut script = RScript::from_str("n <- length(samples)\nmean <- mean(samples)\nsummary <- c(n, mean)");
    script
        .set_input("samples", vec![2.0, 4.0, 6.0, 8.0])
        .unwrap();
    script.set_output("n", RDataType::Num).unwrap();
    script.set_output("mean", RDataType::Num).unwrap();
    script.set_output("summary", RDataType::Nums).unwrap();

    script.execute(&pool).await.unwrap();

    assert_eq!(script.output_num("n"), Some(4.0));
    assert_eq!(script.output_num("mean"), Some(5.0));
    assert_eq!(script.output_nums("summary"), Some(vec![4.0, 5.0]));
    assert_eq!((pool.idle(), pool.active()), (1, 0));
}

#[tokio::test]
async fn test_script_from_file() {
    let connector = summary_connector();
    let pool = pool_with(&connector).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "# Summarize a numeric sample\n\nn <- length(samples)\nmean <- mean(samples)\nsummary <- c(n, mean)"
    )
    .unwrap();

    let mut script = RScript::from_resource(file.path().to_str().unwrap()).unwrap();
    // Comments and blank lines were stripped at load time.
    assert!(!script.script().contains('#'));
    assert!(script.script().contains("summary <- c(n, mean)"));

    script.set_input("samples", vec![1.0, 3.0]).unwrap();
    script.set_output("mean", RDataType::Num).unwrap();
    script.execute(&pool).await.unwrap();

    assert_eq!(script.output_num("mean"), Some(2.0));
}

#[tokio::test]
async fn test_script_from_search_path() {
    let connector = summary_connector();
    let pool = pool_with(&connector).await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("summarize.R"),
        "summary <- c(length(samples), mean(samples))\n",
    )
    .unwrap();

    // Integration tests run in their own process; no other test in this
    // binary touches the variable.
    std::env::set_var(reservoir::constants::SCRIPT_PATH_ENV, dir.path());
    let loaded = RScript::from_resource("summarize.R");
    std::env::remove_var(reservoir::constants::SCRIPT_PATH_ENV);

    let mut script = loaded.unwrap();
    script.set_input("samples", vec![5.0, 7.0]).unwrap();
    script.set_output("summary", RDataType::Nums).unwrap();
    script.execute(&pool).await.unwrap();

    assert_eq!(script.output_nums("summary"), Some(vec![2.0, 6.0]));
}

#[tokio::test]
async fn test_one_executor_per_worker() {
    // Executors are single-worker by contract; concurrent workers each
    // build their own around a shared pool.
    let connector = summary_connector();
    let pool = pool_with(&connector).await;

    let mut workers = Vec::new();
    for i in 0..4 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            let mut script = RScript::from_str("summary <- c(length(samples), mean(samples))");
            let samples: Vec<f64> = (0..=i).map(|v| v as f64).collect();
            script.set_input("samples", samples.clone()).unwrap();
            script.set_output("summary", RDataType::Nums).unwrap();
            script.execute(&pool).await.unwrap();

            let expected_mean = samples.iter().sum::<f64>() / samples.len() as f64;
            assert_eq!(
                script.output_nums("summary"),
                Some(vec![samples.len() as f64, expected_mean])
            );
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!((pool.idle(), pool.active()), (1, 0));
}

#[tokio::test]
async fn test_failed_script_leaves_pool_usable() {
    let connector = summary_connector();
    let pool = pool_with(&connector).await;

    let mut script = RScript::from_str("summary <- c(length(samples), mean(samples))");
    // "samples" never bound: the engine reports a script error.
    script.set_output("summary", RDataType::Nums).unwrap();
    assert!(matches!(
        script.execute(&pool).await,
        Err(Error::Eval(_))
    ));

    // The connection came back; a corrected run succeeds on the same
    // pool.
    script.set_input("samples", vec![1.0, 2.0]).unwrap();
    script.execute(&pool).await.unwrap();
    assert_eq!(script.output_nums("summary"), Some(vec![2.0, 1.5]));
}
