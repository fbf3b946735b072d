use crate::content::ContentStore;
use crate::import::ArchiveExtractor;
use crate::resource::model::{NodeId, ResourceError, Role, User};
use crate::resource::operation::{FileOperation, OperationOutcome, UploadFile};
use crate::resource::storage::ResourceRepository;
use crate::resource::ResourceManager;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpRequest, HttpResponse};
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_NAME_HEADER: &str = "X-User-Name";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

// 默认上传上限 512 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;

pub struct AppState<R, S> {
    pub manager: ResourceManager<R, S>,
    pub max_upload_bytes: u64,
}

impl<R, S> AppState<R, S> {
    pub fn new(manager: ResourceManager<R, S>) -> Self {
        Self {
            manager,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_upload_limit(mut self, max_upload_bytes: u64) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }
}

// 接口响应结构体
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
}

/// 从请求头中取出操作者，身份校验由上游网关完成
pub fn actor_from_request(req: &HttpRequest) -> Result<User, ResourceError> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let id = header(USER_ID_HEADER)
        .ok_or_else(|| ResourceError::PermissionError("缺少用户身份".to_string()))?;
    let username = header(USER_NAME_HEADER).unwrap_or_else(|| id.clone());
    let roles = header(USER_ROLE_HEADER)
        .map(|raw| raw.split(',').map(|r| Role::parse(r.trim())).collect())
        .unwrap_or_else(|| vec![Role::Guest]);

    Ok(User {
        id,
        username,
        roles,
    })
}

pub fn error_response(e: &ResourceError) -> HttpResponse {
    let body = ApiResponse {
        success: false,
        message: e.to_string(),
        data: None,
    };

    match e {
        ResourceError::NotFound(_) => HttpResponse::NotFound().json(body),
        ResourceError::PermissionError(_) => HttpResponse::Forbidden().json(body),
        ResourceError::CorruptArchive(_) | ResourceError::InvalidOperation(_) => {
            HttpResponse::BadRequest().json(body)
        }
        _ => HttpResponse::InternalServerError().json(body),
    }
}

// 处理资源操作的主函数
pub async fn handle_operation<R, S>(
    operation: web::Json<FileOperation>,
    state: web::Data<AppState<R, S>>,
    req: HttpRequest,
) -> HttpResponse
where
    R: ResourceRepository + 'static,
    S: ContentStore + 'static,
{
    let actor = match actor_from_request(&req) {
        Ok(actor) => actor,
        Err(e) => {
            warn!("拒绝匿名请求: {}", e);
            return error_response(&e);
        }
    };

    let operation = operation.into_inner();
    let name = operation.name();
    info!("收到资源操作: {} (用户: {})", name, actor.username);

    match state.manager.handle(operation, &actor).await {
        Ok(outcome) => outcome_response(&outcome),
        Err(e) => {
            error!("资源操作 {} 失败: {}", name, e);
            error_response(&e)
        }
    }
}

fn outcome_response(outcome: &OperationOutcome) -> HttpResponse {
    match serde_json::to_value(outcome) {
        Ok(data) => HttpResponse::Ok().json(ApiResponse {
            success: true,
            message: outcome.summary(),
            data: Some(data),
        }),
        Err(e) => {
            error!("序列化操作结果失败: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse {
                success: false,
                message: "序列化操作结果失败".to_string(),
                data: None,
            })
        }
    }
}

/// 把请求体写进临时目录下的文件，超过 limit 字节时中止
async fn receive_upload(
    mut payload: web::Payload,
    extractor: &ArchiveExtractor,
    limit: u64,
) -> Result<NamedTempFile, ResourceError> {
    let upload = extractor.scratch_file()?;
    let handle = upload
        .as_file()
        .try_clone()
        .map_err(|e| ResourceError::StorageFailure(format!("打开临时文件失败: {}", e)))?;
    let mut file = tokio::fs::File::from_std(handle);

    let mut received: u64 = 0;
    while let Some(chunk) = payload.next().await {
        let chunk = chunk
            .map_err(|e| ResourceError::InvalidOperation(format!("读取上传内容失败: {}", e)))?;
        received += chunk.len() as u64;
        if received > limit {
            return Err(ResourceError::InvalidOperation(format!(
                "上传内容超过 {} 字节",
                limit
            )));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| ResourceError::StorageFailure(format!("写入临时文件失败: {}", e)))?;
    }
    file.flush()
        .await
        .map_err(|e| ResourceError::StorageFailure(format!("写入临时文件失败: {}", e)))?;

    debug!("收到上传内容 {} 字节: {}", received, upload.path().display());
    Ok(upload)
}

/// 上传文件，请求体是文件内容；uncompress 为 true 的 zip 按压缩包导入
pub async fn upload_file<R, S>(
    query: web::Query<UploadFile>,
    payload: web::Payload,
    state: web::Data<AppState<R, S>>,
    req: HttpRequest,
) -> HttpResponse
where
    R: ResourceRepository + 'static,
    S: ContentStore + 'static,
{
    let actor = match actor_from_request(&req) {
        Ok(actor) => actor,
        Err(e) => {
            warn!("拒绝匿名上传: {}", e);
            return error_response(&e);
        }
    };

    let upload = query.into_inner();
    if let Err(e) = upload.check() {
        return error_response(&e);
    }
    info!(
        "收到上传: {} -> 目录 {} (用户: {})",
        upload.name, upload.parent_id, actor.username
    );

    let received =
        match receive_upload(payload, state.manager.extractor(), state.max_upload_bytes).await {
            Ok(received) => received,
            Err(e) => {
                warn!("接收上传 {} 失败: {}", upload.name, e);
                return error_response(&e);
            }
        };

    let result = state
        .manager
        .create_file(
            received.path(),
            &upload.name,
            upload.parent_id,
            &actor,
            upload.uncompress,
        )
        .await;

    match result {
        Ok(nodes) => outcome_response(&OperationOutcome::Created { nodes }),
        Err(e) => {
            error!("上传 {} 失败: {}", upload.name, e);
            error_response(&e)
        }
    }
}

/// 用请求体替换文件内容
pub async fn update_file<R, S>(
    path: web::Path<NodeId>,
    payload: web::Payload,
    state: web::Data<AppState<R, S>>,
    req: HttpRequest,
) -> HttpResponse
where
    R: ResourceRepository + 'static,
    S: ContentStore + 'static,
{
    let node_id = path.into_inner();
    let actor = match actor_from_request(&req) {
        Ok(actor) => actor,
        Err(e) => return error_response(&e),
    };

    let received =
        match receive_upload(payload, state.manager.extractor(), state.max_upload_bytes).await {
            Ok(received) => received,
            Err(e) => return error_response(&e),
        };

    match state.manager.update_file(node_id, received.path(), &actor).await {
        Ok(node) => outcome_response(&OperationOutcome::Updated { node }),
        Err(e) => {
            error!("更新文件 {} 失败: {}", node_id, e);
            error_response(&e)
        }
    }
}

/// 下载文件内容
pub async fn download_file<R, S>(
    path: web::Path<NodeId>,
    state: web::Data<AppState<R, S>>,
    req: HttpRequest,
) -> HttpResponse
where
    R: ResourceRepository + 'static,
    S: ContentStore + 'static,
{
    let node_id = path.into_inner();
    let actor = match actor_from_request(&req) {
        Ok(actor) => actor,
        Err(e) => return error_response(&e),
    };

    match state.manager.open_file(node_id, &actor).await {
        Ok((node, bytes)) => {
            let mime_type = node
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            HttpResponse::Ok()
                .content_type(mime_type)
                .insert_header(ContentDisposition {
                    disposition: DispositionType::Attachment,
                    parameters: vec![DispositionParam::Filename(node.name)],
                })
                .body(bytes)
        }
        Err(e) => {
            warn!("下载文件 {} 失败: {}", node_id, e);
            error_response(&e)
        }
    }
}

pub fn configure<R, S>(cfg: &mut web::ServiceConfig)
where
    R: ResourceRepository + 'static,
    S: ContentStore + 'static,
{
    cfg.route("/api/resources", web::post().to(handle_operation::<R, S>))
        .route("/api/uploads", web::post().to(upload_file::<R, S>))
        .service(
            web::resource("/api/files/{id}")
                .route(web::get().to(download_file::<R, S>))
                .route(web::put().to(update_file::<R, S>)),
        );
}
