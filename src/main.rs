use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::{error, info};
use resource_import::api::{self, AppState};
use resource_import::content::FsContentStore;
use resource_import::db::{self, DEFAULT_WORKSPACE};
use resource_import::import::ArchiveExtractor;
use resource_import::logger::Logger;
use resource_import::resource::{PostgresBackend, ResourceManager};
use resource_import::AppConfig;
use sqlx::postgres::PgPoolOptions;
use std::io;

fn io_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::Other, message)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // 加载 .env
    dotenv().ok();

    let config = AppConfig::from_env().map_err(|e| io_error(format!("配置错误: {}", e)))?;

    // 初始化日志系统
    if let Err(e) = Logger::init(&config.log_dir, config.log_level) {
        eprintln!("初始化日志系统失败: {}，改为输出到标准错误", e);
        let _ = env_logger::Builder::new()
            .filter_level(config.log_level)
            .try_init();
    }

    info!("应用程序启动");

    // 连接数据库
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| io_error(format!("数据库连接错误: {}", e)))?;

    // 初始化数据库
    db::initialize_db(pool.clone())
        .await
        .map_err(|e| io_error(format!("数据库初始化错误: {}", e)))?;

    let backend = PostgresBackend::new(pool);
    match backend.find_root(DEFAULT_WORKSPACE).await {
        Ok(Some(root)) => info!("工作区 {} 根目录: {}", DEFAULT_WORKSPACE, root.id),
        Ok(None) => error!("工作区 {} 没有根目录", DEFAULT_WORKSPACE),
        Err(e) => error!("查询根目录失败: {}", e),
    }

    let content = FsContentStore::new(&config.files_directory)
        .await
        .map_err(|e| io_error(format!("文件存储初始化错误: {}", e)))?;
    let extractor = ArchiveExtractor::new(&config.scratch_directory);
    let manager = ResourceManager::new(backend, content, extractor);

    let app_state =
        web::Data::new(AppState::new(manager).with_upload_limit(config.max_upload_bytes));

    let bind = (config.bind_addr.clone(), config.port);
    info!("服务器启动在 http://{}:{}", bind.0, bind.1);

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .configure(api::configure::<PostgresBackend, FsContentStore>)
    })
    .bind(bind)?
    .run()
    .await
}
