use vergen::EmitBuilder;

fn main() {
    // 版本信息里的构建时间与 git 提交
    EmitBuilder::builder()
        .build_timestamp()
        .git_sha(true)
        .emit()
        .expect("Failed to generate build information");
}
