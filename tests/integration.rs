//! Integration tests for ClickSegmenta

use std::io::Write;
use std::path::{Path, PathBuf};

use clicksegmenta::config::{CliConfig, PipelineSettings};
use clicksegmenta::data::SourceFormat;
use clicksegmenta::model::KMeansParams;
use clicksegmenta::pipeline::{run_from_settings, CUSTOMERS_FILE};
use clicksegmenta::service::{CustomerQuery, SegmentStore, StoreSources};
use clicksegmenta::{load_customer_table, SegmentModel, TableError};
use tempfile::{tempdir, NamedTempFile};

/// Three C1 purchases (one without amount) and one C2 purchase within a month
fn create_two_customer_csv() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let header = [
        "fk_contact",
        "date_purchase",
        "time_purchase",
        "gmv_success",
        "total_tickets_quantity_success",
        "nk_ota_localizer_id",
        "place_origin_return",
        "place_origin",
    ];
    writeln!(file, "{}", header.join(";")).unwrap();
    writeln!(file, "C1;2023-05-02;08:15:00;100,00;1;L1;0;São Paulo").unwrap();
    writeln!(file, "C1;2023-05-10;19:40:00;250,50;2;L2;Campinas;São Paulo").unwrap();
    writeln!(file, "C1;2023-05-20;;;1;L3;0;São Paulo").unwrap();
    writeln!(file, "C2;2023-05-25;12:00:00;50,00;1;L4;0;Curitiba").unwrap();
    file
}

/// A larger source with clearly separated behaviors
fn create_population_csv() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let header = [
        "fk_contact",
        "purchase_datetime",
        "gmv_success",
        "total_tickets_quantity_success",
        "nk_ota_localizer_id",
        "is_round_trip",
        "status_pagamento",
    ];
    writeln!(file, "{}", header.join(",")).unwrap();

    let mut order = 0;
    for customer in 0..12 {
        let (purchases, amount, day) = match customer % 3 {
            0 => (1, 40.0, 1),
            1 => (6, 180.0, 20),
            _ => (2, 2500.0, 10),
        };
        for p in 0..purchases {
            order += 1;
            writeln!(
                file,
                "K{:02},2023-03-{:02} {:02}:30:00,{:.2},{},O{},{},{}",
                customer,
                day + p,
                8 + p,
                amount,
                1 + customer % 2,
                order,
                p % 2,
                if p % 3 == 0 { "pago" } else { "pendente" }
            )
            .unwrap();
        }
    }
    file
}

fn settings(
    transactions: &Path,
    output_dir: PathBuf,
    n_clusters: usize,
    format: SourceFormat,
) -> PipelineSettings {
    PipelineSettings {
        transactions_path: transactions.to_path_buf(),
        format,
        output_dir,
        kmeans: KMeansParams {
            n_clusters,
            ..Default::default()
        },
        silhouette_sample: 500,
        plots: false,
    }
}

fn semicolon_comma() -> SourceFormat {
    SourceFormat {
        separator: b';',
        decimal: ',',
    }
}

#[test]
fn test_end_to_end_two_customers() {
    let source = create_two_customer_csv();
    let out = tempdir().unwrap();
    let settings = settings(source.path(), out.path().to_path_buf(), 6, semicolon_comma());

    let (output, paths) = run_from_settings(&settings).unwrap();

    assert_eq!(output.profiles.len(), 2);
    let c1 = &output.profiles.profiles[0];
    let c2 = &output.profiles.profiles[1];
    assert_eq!(c1.customer_id, "C1");
    assert!((c1.monetary_total - 350.5).abs() < 1e-9);
    assert_eq!(c1.frequency, 3);
    assert!((c1.round_trip_share - 1.0 / 3.0).abs() < 1e-9);
    assert!((c2.monetary_total - 50.0).abs() < 1e-9);
    assert_eq!(c2.recency_days, 1);

    // Two customers and six segments: at most two occupied
    assert!(output.summary.len() <= 2);
    let total: f64 = output.summary.iter().map(|s| s.total_monetary).sum();
    assert!((total - 400.5).abs() < 1e-9);

    let table = load_customer_table(&paths.customers).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.records[0].monetary_total, Some(350.5));
    assert_eq!(table.records[1].monetary_total, Some(50.0));
}

#[test]
fn test_store_serves_persisted_run() {
    let source = create_two_customer_csv();
    let out = tempdir().unwrap();
    let settings = settings(source.path(), out.path().to_path_buf(), 6, semicolon_comma());
    run_from_settings(&settings).unwrap();

    let store = SegmentStore::open(StoreSources {
        customers_path: out.path().join(CUSTOMERS_FILE),
        transactions_path: Some(source.path().to_path_buf()),
        transaction_format: semicolon_comma(),
    })
    .unwrap();
    let snapshot = store.snapshot();

    let summary = store.summary(Some("monetario_total"), false).unwrap();
    let total: f64 = summary
        .iter()
        .map(|row| row["monetario_total"].as_f64().unwrap())
        .sum();
    assert!((total - 400.5).abs() < 1e-9);

    let kpis = snapshot.kpis();
    assert_eq!(kpis.total_customers, 2);
    assert_eq!(kpis.mean_ticket, 200.25);

    let rows = snapshot.customers(&CustomerQuery {
        columns: Some("id_cliente,segmento".to_string()),
        ..Default::default()
    });
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.len() == 2));

    let trend = snapshot.sales_trend().unwrap();
    assert_eq!(trend.len(), 1);
    assert_eq!(trend[0].label, "Mai/23");
    assert_eq!(trend[0].year, 2023);
    assert_eq!(trend[0].sales, 400.5);

    let regions = snapshot.regions().unwrap();
    assert_eq!(regions[0].region, "Curitiba");
    assert_eq!(regions[0].share, 50.0);

    let hourly = snapshot.hourly().unwrap();
    assert_eq!(hourly[0].label, "00h");

    // 4 orders, no payment status, round trips from place_origin_return
    let funnel: Vec<u64> = snapshot.funnel().unwrap().iter().map(|s| s.value).collect();
    assert_eq!(funnel, vec![4, 3, 1, 1, 1]);
}

#[test]
fn test_store_without_transaction_file_serves_customers() {
    let source = create_two_customer_csv();
    let out = tempdir().unwrap();
    let settings = settings(source.path(), out.path().to_path_buf(), 2, semicolon_comma());
    run_from_settings(&settings).unwrap();

    let store = SegmentStore::open(StoreSources {
        customers_path: out.path().join(CUSTOMERS_FILE),
        transactions_path: Some(out.path().join("df_t.csv")),
        transaction_format: semicolon_comma(),
    })
    .unwrap();
    let snapshot = store.snapshot();

    assert!(snapshot.transactions.is_none());
    assert_eq!(snapshot.customers(&CustomerQuery::default()).len(), 2);
    assert!(snapshot.sales_trend().unwrap().is_empty());
    assert!(snapshot.hourly().unwrap().is_empty());
    assert_eq!(snapshot.health().transactions, None);

    // The funnel counts customer rows instead of orders
    let funnel: Vec<u64> = snapshot.funnel().unwrap().iter().map(|s| s.value).collect();
    assert_eq!(funnel, vec![2, 1, 0, 0, 0]);

    // A reload keeps working while the file is still missing
    assert_eq!(store.reload().unwrap().generation, 2);
}

#[test]
fn test_missing_segment_column_is_a_configuration_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "id_cliente;valor_monetario_total;frequencia").unwrap();
    writeln!(file, "C1;350,50;3").unwrap();

    let err = load_customer_table(file.path()).unwrap_err();
    assert_eq!(
        err.downcast_ref::<TableError>(),
        Some(&TableError::MissingColumns(vec!["segmento".to_string()]))
    );
    assert!(err.to_string().contains("segmento"));

    let store = SegmentStore::open(StoreSources {
        customers_path: file.path().to_path_buf(),
        transactions_path: None,
        transaction_format: SourceFormat::default(),
    });
    assert!(store.is_err());
}

#[test]
fn test_runs_are_deterministic() {
    let source = create_population_csv();
    let first_dir = tempdir().unwrap();
    let second_dir = tempdir().unwrap();

    let (first, first_paths) = run_from_settings(&settings(
        source.path(),
        first_dir.path().to_path_buf(),
        3,
        SourceFormat::default(),
    ))
    .unwrap();
    let (second, second_paths) = run_from_settings(&settings(
        source.path(),
        second_dir.path().to_path_buf(),
        3,
        SourceFormat::default(),
    ))
    .unwrap();

    assert_eq!(first.model.labels, second.model.labels);
    assert_eq!(first.model.centroids, second.model.centroids);
    assert_eq!(
        std::fs::read_to_string(&first_paths.customers).unwrap(),
        std::fs::read_to_string(&second_paths.customers).unwrap()
    );
    assert_eq!(
        std::fs::read_to_string(&first_paths.model).unwrap(),
        std::fs::read_to_string(&second_paths.model).unwrap()
    );
}

#[test]
fn test_summary_consistency_and_separation() {
    let source = create_population_csv();
    let out = tempdir().unwrap();
    let (output, _) = run_from_settings(&settings(
        source.path(),
        out.path().to_path_buf(),
        3,
        SourceFormat::default(),
    ))
    .unwrap();

    assert_eq!(output.profiles.len(), 12);
    let sizes: usize = output.summary.iter().map(|s| s.size).sum();
    let shares: f64 = output.summary.iter().map(|s| s.population_share).sum();
    assert_eq!(sizes, 12);
    assert!((shares - 100.0).abs() <= 0.01 * output.summary.len() as f64);

    // Each behavior forms its own segment
    let labels = output.labels();
    for behavior in 0..3 {
        let members: Vec<usize> = (0..12)
            .filter(|c| c % 3 == behavior)
            .map(|c| labels[c])
            .collect();
        assert!(members.iter().all(|&l| l == members[0]));
    }
    assert_ne!(labels[0], labels[1]);
    assert_ne!(labels[1], labels[2]);
    assert_ne!(labels[0], labels[2]);
    assert!(output.silhouette > 0.5);
}

#[test]
fn test_prediction_from_persisted_model() {
    let source = create_population_csv();
    let out = tempdir().unwrap();
    let (output, paths) = run_from_settings(&settings(
        source.path(),
        out.path().to_path_buf(),
        3,
        SourceFormat::default(),
    ))
    .unwrap();

    let model = SegmentModel::from_json(&std::fs::read_to_string(&paths.model).unwrap()).unwrap();
    for (profile, &label) in output.profiles.profiles.iter().zip(output.model.labels.iter()) {
        assert_eq!(model.predict_raw(&profile.feature_vector()).unwrap(), label);
    }
    assert!(model.predict_raw(&[1.0, 2.0]).is_err());
}

#[test]
fn test_settings_from_config_file() {
    let source = create_two_customer_csv();
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "transactions_path = {:?}", source.path().display().to_string()).unwrap();
    writeln!(config, "separator = \";\"").unwrap();
    writeln!(config, "decimal = \",\"").unwrap();
    writeln!(config, "[clustering]").unwrap();
    writeln!(config, "n_clusters = 2").unwrap();

    let file = clicksegmenta::config::FileConfig::load(config.path()).unwrap();
    let settings = PipelineSettings::resolve(&CliConfig::default(), Some(file)).unwrap();
    assert_eq!(settings.transactions_path, source.path());
    assert_eq!(settings.format, semicolon_comma());
    assert_eq!(settings.kmeans.n_clusters, 2);
}
