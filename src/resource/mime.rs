use std::path::Path;

pub trait MimeResolver: Send + Sync {
    /// 根据文件名或扩展名推断 MIME 类型
    fn guess(&self, name: &str) -> String;
}

/// 基于 mime_guess 扩展名表的实现，未知类型返回 application/octet-stream
#[derive(Debug, Default, Clone, Copy)]
pub struct MimeGuessResolver;

impl MimeResolver for MimeGuessResolver {
    fn guess(&self, name: &str) -> String {
        // 既接受 "report.pdf" 也接受裸扩展名 "pdf"
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(name);

        mime_guess::from_ext(ext).first_or_octet_stream().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_from_file_name_or_extension() {
        let resolver = MimeGuessResolver;
        assert_eq!(resolver.guess("notes.txt"), "text/plain");
        assert_eq!(resolver.guess("pdf"), "application/pdf");
        assert_eq!(resolver.guess("photo.PNG"), "image/png");
    }

    #[test]
    fn unknown_extensions_fall_back_to_octet_stream() {
        let resolver = MimeGuessResolver;
        assert_eq!(resolver.guess("data.zzunknown"), "application/octet-stream");
        assert_eq!(resolver.guess("Makefile"), "application/octet-stream");
    }
}
